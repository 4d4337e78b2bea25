//! Synthetic sample traces for demos and UI development.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use rand::Rng;
use tracing::info;

use tracehub::event::TimespanEvent;
use tracehub::{Collector, Recorder, SpanId};

const NUM_TRACES: u64 = 60;
const SPANS_PER_TRACE: u64 = 7;

const HOSTS: &[&str] = &[
    "api.phafsea.org",
    "web.kraesey.net",
    "www3.bleland.com",
    "mun.moonuiburg",
    "shu.plin:9090",
    "luoron.net",
    "api.eproling.org",
    "riphero.ugh",
    "fia.com",
    "jouver.io",
    "strayolis.io",
    "grisaso.io",
];

const NAMES: &[&str] = &[
    "Phafsea",
    "Kraesey",
    "Bleland",
    "Moonuiburg",
    "Erento",
    "Gona",
    "Frence",
    "Shuplin",
    "Luoron",
    "Eproling",
    "Ripherough",
    "Sekhunsea",
    "Jouver",
    "Strayolis",
    "Grisaso",
];

/// Seeds `collector` with a few dozen chained-span traces carrying names,
/// timespans, and log messages.
pub fn seed(collector: Arc<dyn Collector>) -> Result<()> {
    info!(
        traces = NUM_TRACES,
        spans_per_trace = SPANS_PER_TRACE,
        "adding sample data"
    );
    let mut rng = rand::thread_rng();
    for i in 0..NUM_TRACES {
        let root = Recorder::new(SpanId::new_root(), Arc::clone(&collector));
        root.name(HOSTS[rng.gen_range(0..HOSTS.len())]);
        root.event(&fake_timespan(&mut rng));

        let mut parent = root;
        for j in 1..SPANS_PER_TRACE {
            let span = parent.child();
            span.name(NAMES[((i + j) as usize) % NAMES.len()]);
            if j % 3 == 0 {
                span.log("hello");
            }
            if j % 5 == 0 {
                span.msg("hi");
            }
            span.event(&fake_timespan(&mut rng));

            let errs = span.errors();
            if !errs.is_empty() {
                bail!("recorder errors: {errs:?}");
            }
            parent = span;
        }
        let errs = parent.errors();
        if !errs.is_empty() {
            bail!("recorder errors: {errs:?}");
        }
    }
    Ok(())
}

fn fake_timespan(rng: &mut impl Rng) -> TimespanEvent {
    let start = Utc::now() - Duration::milliseconds(rng.gen_range(0..30_000));
    TimespanEvent {
        start,
        end: start + Duration::milliseconds(rng.gen_range(0..30_000)),
    }
}
