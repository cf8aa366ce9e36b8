pub mod deferral;
pub mod slurp;

pub use deferral::{DeferralBuffer, DEFERRAL_RETRY_INTERVAL};
pub use slurp::{FlushOutcome, SlurpQueue, SLURP_FLUSH_DELAY};
