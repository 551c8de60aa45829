use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::Middleware;
use crate::dispatcher::Dispatch;
use crate::error::UnitError;
use crate::pipeline::Next;
use crate::registry::DispatchKind;

fn kind_index(kind: DispatchKind) -> usize {
    match kind {
        DispatchKind::Request => 0,
        DispatchKind::Forward => 1,
        DispatchKind::Include => 2,
        DispatchKind::Error => 3,
        DispatchKind::AsyncResume => 4,
    }
}

/// Processing unit collecting Prometheus-compatible counters.
///
/// All counters are atomics updated with `Ordering::Relaxed`; the unit never
/// blocks or short-circuits a request. Latency and status are recorded in
/// the teardown hook, so a suspended request is counted once it completes.
///
/// Metrics collected:
/// - Dispatches per dispatch kind
/// - Completed dispatches and total latency
/// - Status classes (`1xx` to `5xx`) of completed dispatches
/// - Faults returned by the rest of the pipeline
/// - Coroutine stack size when running under `may`
#[derive(Debug, Default)]
pub struct MetricsMiddleware {
    dispatches: [AtomicUsize; 5],
    completed: AtomicUsize,
    total_latency_ns: AtomicU64,
    max_latency_ns: AtomicU64,
    status_classes: [AtomicUsize; 5],
    faults: AtomicUsize,
    stack_size: AtomicUsize,
}

impl MetricsMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatches seen, all kinds together.
    pub fn request_count(&self) -> usize {
        self.dispatches
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    pub fn dispatch_count(&self, kind: DispatchKind) -> usize {
        self.dispatches[kind_index(kind)].load(Ordering::Relaxed)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    /// Mean latency of completed dispatches; zero before the first one.
    pub fn average_latency(&self) -> Duration {
        let count = self.completed.load(Ordering::Relaxed) as u64;
        if count == 0 {
            Duration::from_nanos(0)
        } else {
            Duration::from_nanos(self.total_latency_ns.load(Ordering::Relaxed) / count)
        }
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_nanos(self.max_latency_ns.load(Ordering::Relaxed))
    }

    /// Completed dispatches whose status was in `class`xx, e.g. `2` for 2xx.
    pub fn status_class_count(&self, class: u16) -> usize {
        match class {
            1..=5 => self.status_classes[usize::from(class - 1)].load(Ordering::Relaxed),
            _ => 0,
        }
    }

    pub fn fault_count(&self) -> usize {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size.load(Ordering::Relaxed)
    }

    /// Render every counter in the Prometheus text exposition format.
    pub fn render_prometheus(&self, application: &str) -> String {
        let mut out = String::new();
        let app = application.replace('\\', "\\\\").replace('"', "\\\"");

        let _ = writeln!(out, "# HELP brrtc_dispatches_total Dispatches entered, by kind");
        let _ = writeln!(out, "# TYPE brrtc_dispatches_total counter");
        for kind in DispatchKind::ALL {
            let _ = writeln!(
                out,
                "brrtc_dispatches_total{{app=\"{app}\",kind=\"{}\"}} {}",
                kind.as_str(),
                self.dispatch_count(kind)
            );
        }

        let _ = writeln!(out, "# HELP brrtc_responses_total Completed dispatches, by status class");
        let _ = writeln!(out, "# TYPE brrtc_responses_total counter");
        for class in 1..=5u16 {
            let _ = writeln!(
                out,
                "brrtc_responses_total{{app=\"{app}\",class=\"{class}xx\"}} {}",
                self.status_class_count(class)
            );
        }

        let _ = writeln!(out, "# HELP brrtc_faults_total Faults returned through the pipeline");
        let _ = writeln!(out, "# TYPE brrtc_faults_total counter");
        let _ = writeln!(out, "brrtc_faults_total{{app=\"{app}\"}} {}", self.fault_count());

        let _ = writeln!(out, "# HELP brrtc_latency_seconds Dispatch latency");
        let _ = writeln!(out, "# TYPE brrtc_latency_seconds summary");
        let _ = writeln!(
            out,
            "brrtc_latency_seconds_sum{{app=\"{app}\"}} {:.6}",
            Duration::from_nanos(self.total_latency_ns.load(Ordering::Relaxed)).as_secs_f64()
        );
        let _ = writeln!(
            out,
            "brrtc_latency_seconds_count{{app=\"{app}\"}} {}",
            self.completed_count()
        );
        let _ = writeln!(
            out,
            "brrtc_latency_seconds_max{{app=\"{app}\"}} {:.6}",
            self.max_latency().as_secs_f64()
        );

        let _ = writeln!(out, "# HELP brrtc_coroutine_stack_bytes Coroutine stack size");
        let _ = writeln!(out, "# TYPE brrtc_coroutine_stack_bytes gauge");
        let _ = writeln!(
            out,
            "brrtc_coroutine_stack_bytes{{app=\"{app}\"}} {}",
            self.stack_size()
        );
        out
    }
}

impl Middleware for MetricsMiddleware {
    fn handle(&self, cx: &mut Dispatch<'_>, next: Next) -> Result<(), UnitError> {
        self.dispatches[kind_index(cx.dispatch_kind())].fetch_add(1, Ordering::Relaxed);
        let result = next.run(cx);
        if matches!(&result, Err(err) if !matches!(err, UnitError::Cancelled)) {
            self.faults.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn after(&self, cx: &mut Dispatch<'_>, latency: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let nanos = latency.as_nanos() as u64;
        self.total_latency_ns.fetch_add(nanos, Ordering::Relaxed);
        self.max_latency_ns.fetch_max(nanos, Ordering::Relaxed);
        let class = cx.status() / 100;
        if (1..=5).contains(&class) {
            self.status_classes[usize::from(class - 1)].fetch_add(1, Ordering::Relaxed);
        }
        // record stack metrics for the current coroutine when available
        if may::coroutine::is_coroutine() {
            let co = may::coroutine::current();
            self.stack_size.store(co.stack_size(), Ordering::Relaxed);
        } else {
            self.stack_size
                .store(may::config().get_stack_size(), Ordering::Relaxed);
        }
    }
}
