#![warn(missing_docs)]
//! `ember-status`
//! Status types shared between the wallet kit and the sync engine.

pub mod sync_status;
