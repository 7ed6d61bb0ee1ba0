//! Binary entry point: parse the CLI surface (spec §6), wire up whichever
//! workload generator and rate generator the flags select, run the reactor
//! loop to completion, and print the accumulated stats. Ported from
//! `httperf.c`'s `main`, minus the generator/collector registration table
//! (`param.c`'s big `switch`), which this expansion replaces with a small
//! set of `if let` checks over the parsed [`Config`].

use anyhow::{bail, Context, Result};
use clap::Parser;

use httpburst::config::Config;
use httpburst::core::Core;
use httpburst::event_bus::{EventArg, EventKind, Subject};
use httpburst::model::{CallKey, MAX_EXTRA_HEADERS};
use httpburst::rate::RateGenerator;
use httpburst::workload::{FixedUriGenerator, SessionLogGenerator, UriListGenerator, UriSetGenerator, WorkloadGenerator};

fn main() -> Result<()> {
    let config = Config::parse();
    init_logging(config.output.verbose);

    if config.protocol.add_header.len() > MAX_EXTRA_HEADERS {
        bail!("--add-header may be given at most {MAX_EXTRA_HEADERS} times");
    }
    config.http_version().map_err(|e| anyhow::anyhow!(e.0))?;
    let client_id = config.client_id().map_err(|e| anyhow::anyhow!(e.0))?;
    let rate_spec = config.rate_spec().map_err(|e| anyhow::anyhow!(e.0))?;
    let workload = build_workload(&config, client_id).context("setting up the workload generator")?;
    let print_request = config.output.print_request.clone();
    let print_reply = config.output.print_reply.clone();

    let mut core = Core::new(config).map_err(|e| anyhow::anyhow!(e.0))?;
    core.workload = workload;
    if let Some(spec) = rate_spec {
        if !spec.is_sequential() {
            core.rate_gen = Some(RateGenerator::new(spec, client_id));
        }
    }
    register_print_handlers(&mut core, print_request, print_reply)?;

    core.run()?;
    print!("{}", core.stats);
    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();
}

/// Select the workload generator implied by the `--wlog` / `--wsesslog` /
/// `--wset` / plain `--uri` flags, in that precedence order, ported from
/// `param.c`'s mutually-exclusive generator selection.
fn build_workload(config: &Config, client_id: u32) -> Result<Option<Box<dyn WorkloadGenerator>>> {
    if let Some(spec) = &config.workload.wlog {
        let (do_loop, path) = spec.split_once(',').context("--wlog expects `y|n,file`")?;
        let do_loop = match do_loop {
            "y" => true,
            "n" => false,
            other => bail!("--wlog's loop flag must be `y` or `n`, got `{other}'"),
        };
        let gen = UriListGenerator::from_file(path, do_loop).with_context(|| format!("reading --wlog file `{path}'"))?;
        return Ok(Some(Box::new(gen)));
    }

    if let Some(spec) = &config.workload.wsesslog {
        let mut parts = spec.splitn(3, ',');
        let _num_sessions: u32 = parts
            .next()
            .context("--wsesslog expects `N,T,file`")?
            .parse()
            .context("--wsesslog's N must be a number")?;
        let _think: f64 = parts
            .next()
            .context("--wsesslog expects `N,T,file`")?
            .parse()
            .context("--wsesslog's T must be a number")?;
        let path = parts.next().context("--wsesslog expects `N,T,file`")?;
        let gen = SessionLogGenerator::from_file(path).with_context(|| format!("reading --wsesslog file `{path}'"))?;
        return Ok(Some(Box::new(gen)));
    }

    if let Some(spec) = config.workload.wset.first() {
        let (num_files, miss_rate) = spec.split_once(',').context("--wset expects `N,P`")?;
        let num_files: u32 = num_files.parse().context("--wset's N must be a number")?;
        let miss_rate: f64 = miss_rate.parse().context("--wset's P must be a number")?;
        let (id, n) = config.identity.client.split_once('/').unwrap_or(("0", "1"));
        let num_clients: u32 = n.parse().unwrap_or(1);
        let _ = id;
        let gen = UriSetGenerator::new(&config.target.uri, num_files, miss_rate, client_id, num_clients);
        return Ok(Some(Box::new(gen)));
    }

    Ok(Some(Box::new(FixedUriGenerator::new(config.target.uri.clone()))))
}

/// Per-call byte buffer accumulated by [`register_print_handlers`], ported
/// from `httperf.c`'s `--print-request`/`--print-reply` options, which dump
/// the exact bytes written to/read from the wire for one call.
#[derive(Default)]
struct PrintBuffers {
    request: Vec<u8>,
    reply: Vec<u8>,
}

/// Wire `--print-request[=header|body]` / `--print-reply[=header|body]` into
/// the event bus: raw send/recv bytes accumulate per call in
/// [`Core::call_ext`] (spec §4.3's typed extension slots) and are dumped to
/// stdout once the call finishes.
fn register_print_handlers(core: &mut Core, print_request: Option<String>, print_reply: Option<String>) -> Result<()> {
    if print_request.is_none() && print_reply.is_none() {
        return Ok(());
    }

    if print_request.is_some() {
        core.events
            .register(EventKind::CallSendRawData, |core: &mut Core, _, subject, arg: &EventArg| {
                let (Subject::Call(call), EventArg::RawData(bytes)) = (subject, arg) else { return };
                if let Some(buf) = core.call_ext.get_mut::<PrintBuffers>(call) {
                    buf.request.extend_from_slice(bytes);
                } else {
                    core.call_ext.set(call, PrintBuffers { request: bytes.to_vec(), reply: Vec::new() });
                }
            })
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    }
    if print_reply.is_some() {
        core.events
            .register(EventKind::CallRecvRawData, |core: &mut Core, _, subject, arg: &EventArg| {
                let (Subject::Call(call), EventArg::RawData(bytes)) = (subject, arg) else { return };
                if let Some(buf) = core.call_ext.get_mut::<PrintBuffers>(call) {
                    buf.reply.extend_from_slice(bytes);
                } else {
                    core.call_ext.set(call, PrintBuffers { request: Vec::new(), reply: bytes.to_vec() });
                }
            })
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    }

    core.events
        .register(EventKind::CallRecvStop, move |core: &mut Core, _, subject, _: &EventArg| {
            let Subject::Call(call) = subject else { return };
            dump_call(core, call, print_request.as_deref(), print_reply.as_deref());
        })
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    Ok(())
}

fn dump_call(core: &Core, call: CallKey, print_request: Option<&str>, print_reply: Option<&str>) {
    let Some(buf) = core.call_ext.get::<PrintBuffers>(call) else { return };
    if print_request.is_some() {
        println!("--- request ---\n{}", String::from_utf8_lossy(&buf.request));
    }
    if print_reply.is_some() {
        println!("--- reply ---\n{}", String::from_utf8_lossy(&buf.reply));
    }
}
