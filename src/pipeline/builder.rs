use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, info};

use super::chain::Pipeline;
use crate::registry::{
    DispatchKind, DispatchKinds, MatchKind, MiddlewareRegistration, Resolution, UrlPattern,
};

/// Binds a handler name to every handler.
pub const ANY_HANDLER: &str = "*";

/// What a pipeline entry is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Pattern(UrlPattern),
    Name(String),
}

/// One declarative `(binding, dispatch kinds, unit)` tuple.
#[derive(Debug, Clone)]
pub struct PipelineEntry {
    /// Index of the unit in declaration order
    pub unit: usize,
    pub binding: Binding,
    pub kinds: DispatchKinds,
}

/// The flat list of pipeline entries an application starts with.
///
/// Built once from the middleware registrations in declaration order; each
/// registration contributes its pattern bindings then its name bindings.
/// [`build`](PipelineTable::build) only filters this list, so pipeline
/// composition can be audited by reading [`entries`](PipelineTable::entries).
pub struct PipelineTable {
    units: Vec<Arc<MiddlewareRegistration>>,
    entries: Vec<PipelineEntry>,
}

impl fmt::Debug for PipelineTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineTable")
            .field("units", &self.units.iter().map(|u| u.name()).collect::<Vec<_>>())
            .field("entries", &self.entries)
            .finish()
    }
}

impl PipelineTable {
    #[must_use]
    pub fn new(units: Vec<Arc<MiddlewareRegistration>>) -> Self {
        let mut entries = Vec::new();
        for (idx, unit) in units.iter().enumerate() {
            let kinds = unit.dispatch_kinds();
            for pattern in unit.url_patterns() {
                entries.push(PipelineEntry {
                    unit: idx,
                    binding: Binding::Pattern(pattern.clone()),
                    kinds,
                });
            }
            for name in unit.handler_names() {
                entries.push(PipelineEntry {
                    unit: idx,
                    binding: Binding::Name(name.clone()),
                    kinds,
                });
            }
        }
        info!(
            units = units.len(),
            entries = entries.len(),
            "Pipeline table built"
        );
        Self { units, entries }
    }

    #[must_use]
    pub fn entries(&self) -> &[PipelineEntry] {
        &self.entries
    }

    #[must_use]
    pub fn units(&self) -> &[Arc<MiddlewareRegistration>] {
        &self.units
    }

    /// Units that apply to a dispatch of `kind` to `path`, resolved as
    /// `resolution`, followed by the handler.
    ///
    /// Pattern-bound units come first, then name-bound units, each group in
    /// declaration order. A unit bound both ways appears once, in the
    /// pattern group.
    #[must_use]
    pub fn build(&self, resolution: &Resolution, path: &str, kind: DispatchKind) -> Pipeline {
        let mut by_pattern: SmallVec<[usize; 8]> = SmallVec::new();
        let mut by_name: SmallVec<[usize; 8]> = SmallVec::new();

        for entry in &self.entries {
            if !entry.kinds.contains(kind) {
                continue;
            }
            match &entry.binding {
                Binding::Pattern(pattern) => {
                    if pattern_applies(pattern, resolution, path) && !by_pattern.contains(&entry.unit)
                    {
                        by_pattern.push(entry.unit);
                    }
                }
                Binding::Name(name) => {
                    if name_applies(name, resolution) && !by_name.contains(&entry.unit) {
                        by_name.push(entry.unit);
                    }
                }
            }
        }

        // Relative declaration order inside each group.
        by_pattern.sort_unstable();
        by_name.sort_unstable();
        by_name.retain(|idx| !by_pattern.contains(idx));

        let units = by_pattern
            .iter()
            .chain(by_name.iter())
            .filter_map(|idx| self.units.get(*idx).map(Arc::clone))
            .collect();

        let pipeline = Pipeline::new(units, Arc::clone(&resolution.handler), kind);
        debug!(
            path = %path,
            dispatch_kind = %kind,
            handler_name = %resolution.handler_name(),
            stages = ?pipeline.stage_names(),
            "Pipeline built"
        );
        pipeline
    }
}

fn pattern_applies(pattern: &UrlPattern, resolution: &Resolution, path: &str) -> bool {
    match pattern {
        UrlPattern::Default => matches!(resolution.kind, MatchKind::Default | MatchKind::Static),
        other => other.matches(path),
    }
}

fn name_applies(name: &str, resolution: &Resolution) -> bool {
    if name == ANY_HANDLER {
        resolution.kind != MatchKind::Static
    } else {
        name == resolution.handler_name()
    }
}
