use crate::models::{Endpoint, HttpMethod, new_endpoint_id};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

fn compile(pattern: &str) -> Vec<Segment> {
    pattern
        .split('/')
        .map(|seg| match seg.strip_prefix(':') {
            Some(name) if !name.is_empty() => Segment::Param(name.to_string()),
            _ => Segment::Literal(seg.to_string()),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub endpoint: Arc<Endpoint>,
    pub params: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct RouteTable {
    /// Registration order. Re-registration keeps the original slot.
    arena: Vec<Arc<Endpoint>>,
    compiled: Vec<Vec<Segment>>,
    by_id: HashMap<String, usize>,
    /// (method, segment count) -> arena slots in registration order
    index: HashMap<(HttpMethod, usize), Vec<usize>>,
}

impl RouteTable {
    fn rebuild_index(&mut self) {
        self.index.clear();
        for (slot, ep) in self.arena.iter().enumerate() {
            self.index
                .entry((ep.method, self.compiled[slot].len()))
                .or_default()
                .push(slot);
        }
    }
}

/// Route definitions, matched by method and path segments.
///
/// When several patterns match one path, an enabled endpoint beats a
/// disabled one, then the most specific pattern wins (comparing segments
/// left to right, a literal beats a parameter), then the earliest
/// registration.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    table: RwLock<RouteTable>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces (by id) an endpoint. Returns its id.
    pub fn register(&self, mut endpoint: Endpoint) -> String {
        if endpoint.id.is_empty() {
            endpoint.id = new_endpoint_id();
        }
        let id = endpoint.id.clone();
        let compiled = compile(&endpoint.path);
        let mut table = self.table.write();
        match table.by_id.get(&id).copied() {
            Some(slot) => {
                table.arena[slot] = Arc::new(endpoint);
                table.compiled[slot] = compiled;
            }
            None => {
                let slot = table.arena.len();
                table.arena.push(Arc::new(endpoint));
                table.compiled.push(compiled);
                table.by_id.insert(id.clone(), slot);
            }
        }
        table.rebuild_index();
        id
    }

    pub fn get(&self, id: &str) -> Option<Arc<Endpoint>> {
        let table = self.table.read();
        table.by_id.get(id).map(|slot| table.arena[*slot].clone())
    }

    /// Registration position of `id`. Re-registering keeps it.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.table.read().by_id.get(id).copied()
    }

    pub fn list(&self) -> Vec<Arc<Endpoint>> {
        self.table.read().arena.clone()
    }

    pub fn len(&self) -> usize {
        self.table.read().arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves a concrete path (no query string).
    pub fn find(&self, method: HttpMethod, path: &str) -> Option<RouteMatch> {
        let parts: Vec<&str> = path.split('/').collect();
        let table = self.table.read();
        let slots = table.index.get(&(method, parts.len()))?;

        let mut best: Option<(usize, (bool, Vec<bool>))> = None;
        for &slot in slots {
            let pattern = &table.compiled[slot];
            let matched = pattern.iter().zip(parts.iter()).all(|(seg, part)| match seg {
                Segment::Literal(lit) => lit == part,
                Segment::Param(_) => true,
            });
            if !matched {
                continue;
            }
            let rank = (
                table.arena[slot].enabled,
                pattern.iter().map(|s| matches!(s, Segment::Literal(_))).collect::<Vec<_>>(),
            );
            // strictly better only, so the earliest registration keeps ties
            if best.as_ref().map(|(_, r)| rank > *r).unwrap_or(true) {
                best = Some((slot, rank));
            }
        }

        let (slot, _) = best?;
        let params = table.compiled[slot]
            .iter()
            .zip(parts.iter())
            .filter_map(|(seg, part)| match seg {
                Segment::Param(name) => Some((name.clone(), part.to_string())),
                Segment::Literal(_) => None,
            })
            .collect();
        Some(RouteMatch { endpoint: table.arena[slot].clone(), params })
    }
}
