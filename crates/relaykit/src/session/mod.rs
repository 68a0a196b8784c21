//! Live session bookkeeping
//!
//! Servers register every handshaked session in a [`SessionRegistry`] and run its read loop under an
//! [`IdleWatchdog`], which ends the session once its [`Activity`] has been quiet for too long.

pub use self::{
    registry::{Session, SessionRegistry},
    stream::ActivityStream,
    watchdog::{Activity, IdleWatchdog, race},
};

mod registry;
mod stream;
mod watchdog;
