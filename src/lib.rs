//! Family routine sessions and the points ledger behind them.
//!
//! Every public operation takes a [`state::CoreState`] and a pre-validated
//! [`auth::AuthContext`], runs in at most one store transaction and returns an
//! [`AppResult`].

pub mod auth;
pub mod catalog;
pub mod config;
pub mod db;
mod error;
pub mod id;
pub mod ledger;
pub mod logging;
pub mod migrate;
pub mod op_logging;
pub mod paging;
pub mod performance;
pub mod profiles;
pub mod progress;
pub mod rewards;
pub mod session;
pub mod state;
pub mod time;

pub use error::{AppError, AppResult, ErrorKind};
pub use logging::init_logging;
pub use state::CoreState;
