//! Shared scaffolding for the multi-component scenario tests (spec §8),
//! following the teacher's own `tcp` crate's `tests/util` convention of
//! keeping test-only setup helpers out of the scenario files themselves.

use clap::Parser;

use httpburst::config::Config;
use httpburst::Core;

/// Build a `Core` from a `Config` parsed the same way `main.rs` does, with
/// `httpburst` standing in for `argv[0]`.
pub fn build_core(args: &[&str]) -> Core {
    let mut argv = vec!["httpburst"];
    argv.extend_from_slice(args);
    let config = Config::parse_from(argv);
    Core::new(config).unwrap()
}
