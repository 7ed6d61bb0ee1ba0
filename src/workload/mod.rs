//! Workload Generators (spec §4.9), ported from the `Load_Generator`
//! interface in `httperf.h` (`init`/`no_op`/`stop` plus an `EV_CALL_NEW`
//! handler that calls `call_set_uri`).
//!
//! Rather than three free functions wired through the event bus by function
//! pointer, `WorkloadGenerator` is a trait object the core asks to fill in
//! each new call's request before it is issued; `next()` returning `false`
//! means the generator has nothing further to contribute and the run should
//! wind down once calls already in flight finish, mirroring `core_exit()`
//! being called from inside `uri_wlog.c`'s `set_uri`.

pub mod fixed;
pub mod session_log;
pub mod uri_list;
pub mod uri_set;

use crate::model::Request;

/// One generator's contribution to a freshly created call. Returning
/// `false` asks the driving loop to stop issuing further calls after this
/// one, without aborting calls already in flight.
pub trait WorkloadGenerator {
    fn populate(&mut self, request: &mut Request) -> bool;
}

pub use fixed::FixedUriGenerator;
pub use session_log::SessionLogGenerator;
pub use uri_list::UriListGenerator;
pub use uri_set::UriSetGenerator;
