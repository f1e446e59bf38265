//! Buffer library: the routing table from stream identity to raw buffer.
//!
//! The library owns every [`RawBuffer`] of a run. Routes decide, per identity, which
//! output store and group its records go to; buffers are created on demand the first time
//! an identity is resolved, either while a streamer reads the input header or when a new
//! identity shows up mid-stream.
//!
//! Identities routed to the same `(output store, group)` share one buffer. An identity is
//! never split across two buffers.

use crate::error::{RawError, RawResult};
use crate::raw::buffer::{
    BufferId, RawBuffer, RawBufferList, HEADER_GROUP, MAX_BUFFER_BYTES, MAX_BUFFER_ROWS,
};
use crate::raw::key::StreamKey;
use crate::raw::routing::{KeySelector, RouteEntry, RoutingSpec};
use crate::raw::table::{Schema, Table};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Where a route sends its identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// Write into `out_stream`. `group` may contain `{key}`; `None` uses the identity's
    /// default group name.
    Write {
        out_stream: PathBuf,
        group: Option<String>,
        capacity: Option<usize>,
    },
    /// Decode and count, but do not keep.
    Discard,
}

impl RouteTarget {
    /// Write to `out_stream` with the identity's default group and capacity.
    pub fn write(out_stream: impl Into<PathBuf>) -> Self {
        RouteTarget::Write {
            out_stream: out_stream.into(),
            group: None,
            capacity: None,
        }
    }

    fn from_entry(entry: &RouteEntry, default_out: &Path) -> Self {
        if entry.discard {
            return RouteTarget::Discard;
        }
        RouteTarget::Write {
            out_stream: entry
                .destination
                .clone()
                .unwrap_or_else(|| default_out.to_path_buf()),
            group: entry.group.clone(),
            capacity: entry.capacity,
        }
    }

    fn validate(&self, selector: &KeySelector) -> RawResult<()> {
        if let RouteTarget::Write {
            out_stream,
            group,
            capacity,
        } = self
        {
            if out_stream.as_os_str().is_empty() {
                return Err(RawError::Configuration(format!(
                    "route '{selector}' has an empty destination"
                )));
            }
            if let Some(group) = group {
                if group.trim().is_empty() {
                    return Err(RawError::Configuration(format!(
                        "route '{selector}' has an empty group name"
                    )));
                }
                if group == HEADER_GROUP {
                    return Err(RawError::Configuration(format!(
                        "route '{selector}' uses the reserved group '{HEADER_GROUP}'"
                    )));
                }
            }
            if *capacity == Some(0) {
                return Err(RawError::Configuration(format!(
                    "route '{selector}' has zero capacity"
                )));
            }
            if let Some(rows) = capacity.filter(|&rows| rows > MAX_BUFFER_ROWS) {
                return Err(RawError::Configuration(format!(
                    "route '{selector}' capacity {rows} exceeds the maximum of {MAX_BUFFER_ROWS} rows"
                )));
            }
        }
        Ok(())
    }
}

/// A route resolved for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Output store.
    pub out_stream: PathBuf,
    /// Group inside the store.
    pub group: String,
    /// Explicit capacity from the route, if any.
    pub capacity: Option<usize>,
}

/// Mapping from stream identity to raw buffer.
#[derive(Debug, Clone)]
pub struct RawBufferLibrary {
    routes: Vec<(KeySelector, RouteTarget)>,
    default_route: RouteTarget,
    default_capacity: usize,
    capacity_limit: Option<usize>,
    buffers: Vec<RawBuffer>,
    by_key: HashMap<StreamKey, Option<BufferId>>,
    by_destination: HashMap<(PathBuf, String), BufferId>,
}

impl RawBufferLibrary {
    /// Empty library. Identities without a route are discarded.
    pub fn new(default_capacity: usize) -> Self {
        Self {
            routes: Vec::new(),
            default_route: RouteTarget::Discard,
            default_capacity,
            capacity_limit: None,
            buffers: Vec::new(),
            by_key: HashMap::new(),
            by_destination: HashMap::new(),
        }
    }

    /// Library sending every identity to `out_stream`, one group per identity.
    pub fn catch_all(out_stream: impl Into<PathBuf>, default_capacity: usize) -> Self {
        let mut lib = Self::new(default_capacity);
        lib.default_route = RouteTarget::write(out_stream);
        lib
    }

    /// Builds a library from a routing spec. Identities the spec does not mention go to
    /// `default_out` unless the spec has its own `*` entry.
    pub fn from_routing(
        spec: &RoutingSpec,
        default_out: &Path,
        default_capacity: usize,
    ) -> RawResult<Self> {
        let mut lib = Self::catch_all(default_out, default_capacity);
        let mut saw_default = false;
        for (selector, entry) in spec.entries() {
            let target = RouteTarget::from_entry(entry, default_out);
            if *selector == KeySelector::Any {
                if saw_default {
                    return Err(RawError::Configuration(
                        "routing spec has more than one '*' entry".into(),
                    ));
                }
                saw_default = true;
                target.validate(selector)?;
                lib.default_route = target;
            } else {
                lib.add_route(selector.clone(), target)?;
            }
        }
        Ok(lib)
    }

    /// Adds a route. Fails if any identity would be claimed twice.
    pub fn add_route(&mut self, selector: KeySelector, target: RouteTarget) -> RawResult<()> {
        if selector == KeySelector::Any {
            target.validate(&selector)?;
            self.default_route = target;
            return Ok(());
        }
        target.validate(&selector)?;
        if let Some((existing, _)) = self.routes.iter().find(|(s, _)| s.overlaps(&selector)) {
            return Err(RawError::Configuration(format!(
                "stream identity routed twice: '{selector}' overlaps '{existing}'"
            )));
        }
        if let Some(key) = self
            .by_key
            .keys()
            .find(|key| selector.matches(key))
        {
            return Err(RawError::Configuration(format!(
                "stream identity {key} already has a buffer"
            )));
        }
        self.routes.push((selector, target));
        Ok(())
    }

    /// Upper bound applied to every buffer created from now on.
    pub fn set_capacity_limit(&mut self, limit: Option<usize>) {
        self.capacity_limit = limit;
    }

    fn route_for(&self, key: &StreamKey) -> &RouteTarget {
        self.routes
            .iter()
            .find(|(sel, _)| sel.matches(key))
            .map(|(_, target)| target)
            .unwrap_or(&self.default_route)
    }

    /// Resolves where `key` goes, without creating anything. `None` means discard.
    pub fn resolve(&self, key: &StreamKey) -> Option<Destination> {
        match self.route_for(key) {
            RouteTarget::Discard => None,
            RouteTarget::Write {
                out_stream,
                group,
                capacity,
            } => Some(Destination {
                out_stream: out_stream.clone(),
                group: group
                    .as_deref()
                    .map(|t| key.expand(t))
                    .unwrap_or_else(|| key.default_group()),
                capacity: *capacity,
            }),
        }
    }

    /// Buffer already assigned to `key`, if any.
    pub fn lookup(&self, key: &StreamKey) -> Option<BufferId> {
        self.by_key.get(key).copied().flatten()
    }

    /// Whether `key` has been resolved to discard.
    pub fn is_discarded(&self, key: &StreamKey) -> bool {
        matches!(self.by_key.get(key), Some(None))
    }

    /// Returns the buffer for `key`, creating it with `schema` on first sight.
    ///
    /// `Ok(None)` means the identity is discarded. Fails with a configuration error when
    /// the buffer that `key` resolves to was created with a different schema, or when two
    /// routes sharing a buffer ask for different capacities.
    pub fn buffer_for(
        &mut self,
        key: &StreamKey,
        schema: &Arc<Schema>,
    ) -> RawResult<Option<BufferId>> {
        if let Some(slot) = self.by_key.get(key) {
            return match slot {
                None => Ok(None),
                Some(id) => {
                    self.check_schema(*id, key, schema)?;
                    Ok(Some(*id))
                }
            };
        }

        let Some(dest) = self.resolve(key) else {
            debug!(%key, "stream identity discarded");
            self.by_key.insert(key.clone(), None);
            return Ok(None);
        };
        if dest.group == HEADER_GROUP {
            return Err(RawError::Configuration(format!(
                "stream identity {key} resolves to the reserved group '{HEADER_GROUP}'"
            )));
        }

        let slot = (dest.out_stream.clone(), dest.group.clone());
        let capacity = self.capacity_of(&dest);
        let id = match self.by_destination.get(&slot) {
            Some(&id) => {
                self.check_schema(id, key, schema)?;
                let existing = self.buffers[id.0].capacity();
                if dest.capacity.is_some() && existing != capacity {
                    return Err(RawError::Configuration(format!(
                        "group '{}' in {} requested with capacities {existing} and {capacity}",
                        dest.group,
                        dest.out_stream.display()
                    )));
                }
                id
            }
            None => {
                check_allocation(key, &dest, capacity, schema)?;
                let id = BufferId(self.buffers.len());
                debug!(
                    %key,
                    out_stream = %dest.out_stream.display(),
                    group = %dest.group,
                    capacity,
                    "creating raw buffer"
                );
                self.buffers.push(RawBuffer::new(
                    dest.out_stream,
                    dest.group,
                    Table::new(Arc::clone(schema), capacity),
                ));
                self.by_destination.insert(slot, id);
                id
            }
        };
        self.buffers[id.0].add_key(key.clone());
        self.by_key.insert(key.clone(), Some(id));
        Ok(Some(id))
    }

    fn capacity_of(&self, dest: &Destination) -> usize {
        let capacity = dest.capacity.unwrap_or(self.default_capacity);
        match self.capacity_limit {
            Some(limit) => capacity.min(limit).max(1),
            None => capacity.max(1),
        }
    }

    fn check_schema(&self, id: BufferId, key: &StreamKey, schema: &Arc<Schema>) -> RawResult<()> {
        let buffer = &self.buffers[id.0];
        if buffer.table().schema().as_ref() != schema.as_ref() {
            return Err(RawError::Configuration(format!(
                "stream identity {key} does not match the layout of group '{}' in {}",
                buffer.group(),
                buffer.out_stream().display()
            )));
        }
        Ok(())
    }

    /// Buffer behind `id`.
    pub fn buffer(&self, id: BufferId) -> &RawBuffer {
        &self.buffers[id.0]
    }

    /// Mutable buffer behind `id`.
    pub fn buffer_mut(&mut self, id: BufferId) -> &mut RawBuffer {
        &mut self.buffers[id.0]
    }

    /// Every buffer with its handle, in creation order.
    pub fn buffers(&self) -> impl Iterator<Item = (BufferId, &RawBuffer)> {
        self.buffers.iter().enumerate().map(|(i, b)| (BufferId(i), b))
    }

    /// Number of buffers created so far.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffer was created yet.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Buffers at capacity.
    pub fn full_buffers(&self) -> RawBufferList {
        self.buffers()
            .filter(|(_, b)| b.is_full())
            .map(|(id, _)| id)
            .collect()
    }

    /// Buffers holding at least one row.
    pub fn nonempty_buffers(&self) -> RawBufferList {
        self.buffers()
            .filter(|(_, b)| !b.is_empty())
            .map(|(id, _)| id)
            .collect()
    }

    /// Every output store this library can write to, deduplicated and sorted.
    pub fn list_destinations(&self) -> Vec<PathBuf> {
        let mut out = BTreeSet::new();
        for (_, target) in &self.routes {
            if let RouteTarget::Write { out_stream, .. } = target {
                out.insert(out_stream.clone());
            }
        }
        if let RouteTarget::Write { out_stream, .. } = &self.default_route {
            out.insert(out_stream.clone());
        }
        for buffer in &self.buffers {
            out.insert(buffer.out_stream().to_path_buf());
        }
        out.into_iter().collect()
    }
}

/// Rejects buffers whose up-front allocation would exceed [`MAX_BUFFER_BYTES`].
fn check_allocation(
    key: &StreamKey,
    dest: &Destination,
    capacity: usize,
    schema: &Schema,
) -> RawResult<()> {
    let bytes = (capacity as u64).checked_mul(schema.row_bytes());
    match bytes {
        Some(bytes) if bytes <= MAX_BUFFER_BYTES => Ok(()),
        _ => Err(RawError::Configuration(format!(
            "group '{}' for stream identity {key} would reserve more than {MAX_BUFFER_BYTES} \
             bytes ({capacity} rows); lower its capacity",
            dest.group
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::table::ColumnType;
    use serde_json::json;

    fn schema(samples: usize) -> Arc<Schema> {
        Arc::new(
            Schema::default()
                .with("timestamp", ColumnType::U64)
                .with("waveform", ColumnType::Waveform(samples)),
        )
    }

    #[test]
    fn catch_all_creates_one_group_per_identity() {
        let mut lib = RawBufferLibrary::catch_all("run.raw", 16);
        let s = schema(4);
        let a = lib.buffer_for(&StreamKey::Int(0), &s).unwrap().unwrap();
        let b = lib.buffer_for(&StreamKey::Int(1), &s).unwrap().unwrap();
        let again = lib.buffer_for(&StreamKey::Int(0), &s).unwrap().unwrap();
        assert_ne!(a, b);
        assert_eq!(a, again);
        assert_eq!(lib.buffer(a).group(), "ch0");
        assert_eq!(lib.buffer(b).group(), "ch1");
        assert_eq!(lib.buffer(a).capacity(), 16);
        assert_eq!(lib.list_destinations(), vec![PathBuf::from("run.raw")]);
    }

    #[test]
    fn identities_sharing_a_group_share_a_buffer() {
        let spec = RoutingSpec::from_json_value(&json!({
            "0-3": {"destination": "geds.raw", "group": "geds", "capacity": 8}
        }))
        .unwrap();
        let mut lib = RawBufferLibrary::from_routing(&spec, Path::new("run.raw"), 32).unwrap();
        let s = schema(2);
        let a = lib.buffer_for(&StreamKey::Int(0), &s).unwrap().unwrap();
        let b = lib.buffer_for(&StreamKey::Int(3), &s).unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(lib.buffer(a).keys(), &[StreamKey::Int(0), StreamKey::Int(3)]);
        assert_eq!(lib.buffer(a).capacity(), 8);

        // Unlisted identities fall back to the default output.
        let c = lib.buffer_for(&StreamKey::Int(9), &s).unwrap().unwrap();
        assert_eq!(lib.buffer(c).out_stream(), Path::new("run.raw"));
        assert_eq!(lib.buffer(c).capacity(), 32);
        assert_eq!(
            lib.list_destinations(),
            vec![PathBuf::from("geds.raw"), PathBuf::from("run.raw")]
        );
    }

    #[test]
    fn overlapping_routes_are_rejected() {
        let spec = RoutingSpec::from_json_value(&json!({
            "0-3": {"destination": "a.raw"},
            "2": {"destination": "b.raw"}
        }))
        .unwrap();
        let err = RawBufferLibrary::from_routing(&spec, Path::new("run.raw"), 8).unwrap_err();
        assert!(matches!(err, RawError::Configuration(msg) if msg.contains("routed twice")));
    }

    #[test]
    fn reserved_and_empty_groups_are_rejected() {
        let spec = RoutingSpec::from_json_value(&json!({"1": {"group": "header"}})).unwrap();
        assert!(RawBufferLibrary::from_routing(&spec, Path::new("run.raw"), 8).is_err());
        let spec = RoutingSpec::from_json_value(&json!({"1": {"group": " "}})).unwrap();
        assert!(RawBufferLibrary::from_routing(&spec, Path::new("run.raw"), 8).is_err());
        let spec = RoutingSpec::from_json_value(&json!({"1": {"capacity": 0}})).unwrap();
        assert!(RawBufferLibrary::from_routing(&spec, Path::new("run.raw"), 8).is_err());
    }

    #[test]
    fn capacities_past_the_row_cap_are_rejected() {
        let spec =
            RoutingSpec::from_json_value(&json!({"0": {"capacity": 4_611_686_018_427_387_904_u64}}))
                .unwrap();
        let err = RawBufferLibrary::from_routing(&spec, Path::new("run.raw"), 8).unwrap_err();
        assert!(matches!(err, RawError::Configuration(msg) if msg.contains("exceeds the maximum")));

        let spec = RoutingSpec::from_json_value(&json!({"0": {"capacity": MAX_BUFFER_ROWS}})).unwrap();
        assert!(RawBufferLibrary::from_routing(&spec, Path::new("run.raw"), 8).is_ok());
    }

    #[test]
    fn oversized_buffers_are_refused_before_allocation() {
        let mut lib = RawBufferLibrary::catch_all("run.raw", MAX_BUFFER_ROWS);
        let err = lib.buffer_for(&StreamKey::Int(0), &schema(65_535)).unwrap_err();
        assert!(matches!(err, RawError::Configuration(msg) if msg.contains("would reserve")));
        assert!(lib.is_empty());
        assert_eq!(lib.lookup(&StreamKey::Int(0)), None);
    }

    #[test]
    fn schema_conflict_in_shared_group_is_a_configuration_error() {
        let spec =
            RoutingSpec::from_json_value(&json!({"0-1": {"group": "all"}})).unwrap();
        let mut lib = RawBufferLibrary::from_routing(&spec, Path::new("run.raw"), 8).unwrap();
        lib.buffer_for(&StreamKey::Int(0), &schema(4)).unwrap();
        let err = lib.buffer_for(&StreamKey::Int(1), &schema(8)).unwrap_err();
        assert!(matches!(err, RawError::Configuration(_)));
        assert_eq!(lib.lookup(&StreamKey::Int(1)), None);
    }

    #[test]
    fn conflicting_capacities_are_rejected() {
        let spec = RoutingSpec::from_json_value(&json!({
            "0": {"group": "g", "capacity": 4},
            "1": {"group": "g", "capacity": 6}
        }))
        .unwrap();
        let mut lib = RawBufferLibrary::from_routing(&spec, Path::new("run.raw"), 8).unwrap();
        let s = schema(1);
        lib.buffer_for(&StreamKey::Int(0), &s).unwrap();
        assert!(lib.buffer_for(&StreamKey::Int(1), &s).is_err());
    }

    #[test]
    fn discard_default_drops_unmapped_identities() {
        let spec = RoutingSpec::from_json_value(&json!({
            "5": {"destination": "five.raw"},
            "*": {"discard": true}
        }))
        .unwrap();
        let mut lib = RawBufferLibrary::from_routing(&spec, Path::new("run.raw"), 8).unwrap();
        let s = schema(1);
        assert!(lib.buffer_for(&StreamKey::Int(5), &s).unwrap().is_some());
        assert!(lib.buffer_for(&StreamKey::Int(6), &s).unwrap().is_none());
        assert!(lib.is_discarded(&StreamKey::Int(6)));
        assert_eq!(lib.list_destinations(), vec![PathBuf::from("five.raw")]);
    }

    #[test]
    fn capacity_limit_clips_new_buffers() {
        let mut lib = RawBufferLibrary::catch_all("run.raw", 8192);
        lib.set_capacity_limit(Some(3));
        let id = lib.buffer_for(&StreamKey::Int(0), &schema(1)).unwrap().unwrap();
        assert_eq!(lib.buffer(id).capacity(), 3);
    }

    #[test]
    fn cannot_route_an_identity_that_already_has_a_buffer() {
        let mut lib = RawBufferLibrary::catch_all("run.raw", 8);
        lib.buffer_for(&StreamKey::Int(2), &schema(1)).unwrap();
        let err = lib
            .add_route(KeySelector::Range(0, 4), RouteTarget::write("other.raw"))
            .unwrap_err();
        assert!(matches!(err, RawError::Configuration(_)));
    }
}
