mod error;
mod shutdown;

pub mod prelude {
    pub use crate::error::CampaignError;
    pub use crate::shutdown::{DelegatedShutdownListener, ShutdownHandle, ShutdownSignalError};
}
