// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed, ordered references between items ('iref').

use crate::bmff::{BMFFBox, ResourceTracker, be_u16, be_u32, check_parser_state, read_fullbox_version_no_flags, write_box, write_full_box};
use crate::boxes::{BoxType, FourCC, reference_type};
use crate::item::ItemCatalog;
use crate::{Error, Result, SubCode, TryVec};
use byteorder::{BigEndian, WriteBytesExt};
use log::warn;
use std::collections::BTreeMap;
use std::io::Read;

/// One single-item-type reference box: `from` refers to each of `to`, in order.
/// See ISO 14496-12:2015 § 8.11.12
#[derive(Debug, PartialEq)]
pub struct Reference {
    pub reference_type: FourCC,
    pub from: u32,
    pub to: TryVec<u32>,
}

/// All item references of a file.
///
/// Reference boxes are kept in file order for writing. Lookups go through
/// adjacency maps keyed by `(item, reference type)`; boxes with the same key
/// append to the same ordered target list.
#[derive(Debug, PartialEq, Default)]
pub struct ReferenceGraph {
    references: TryVec<Reference>,
    forward: BTreeMap<(u32, FourCC), TryVec<u32>>,
    backward: BTreeMap<(u32, FourCC), TryVec<u32>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

impl ReferenceGraph {
    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    /// Targets of `from`'s references of `reference_type`, in stored order.
    pub fn references_from(&self, from: u32, reference_type: FourCC) -> impl Iterator<Item = u32> + '_ {
        self.forward
            .get(&(from, reference_type))
            .into_iter()
            .flat_map(|to| to.iter().copied())
    }

    /// Items that refer to `to` with `reference_type`, in stored order.
    pub fn references_to(&self, to: u32, reference_type: FourCC) -> impl Iterator<Item = u32> + '_ {
        self.backward
            .get(&(to, reference_type))
            .into_iter()
            .flat_map(|from| from.iter().copied())
    }

    #[must_use]
    pub fn has_references(&self, from: u32, reference_type: FourCC) -> bool {
        self.forward.contains_key(&(from, reference_type))
    }

    /// Append a reference box. Targets keep their order.
    pub(crate) fn add(&mut self, reference_type: FourCC, from: u32, to: &[u32]) -> Result<()> {
        let mut targets = TryVec::with_capacity(to.len())?;
        targets.extend_from_slice(to)?;
        self.insert(Reference {
            reference_type,
            from,
            to: targets,
        })
    }

    fn insert(&mut self, reference: Reference) -> Result<()> {
        if !reference.to.is_empty() {
            let forward = self
                .forward
                .entry((reference.from, reference.reference_type))
                .or_insert_with(TryVec::new);
            forward.extend_from_slice(&reference.to)?;
        }
        for &target in reference.to.iter() {
            let backward = self
                .backward
                .entry((target, reference.reference_type))
                .or_insert_with(TryVec::new);
            if !backward.contains(&reference.from) {
                backward.push(reference.from)?;
            }
        }
        self.references.push(reference)?;
        Ok(())
    }

    /// Check that every reference names existing items and that references are acyclic.
    pub(crate) fn validate(&self, catalog: &ItemCatalog) -> Result<()> {
        for r in self.references.iter() {
            if !catalog.contains(r.from) || r.to.iter().any(|id| !catalog.contains(*id)) {
                warn!("'{}' reference from item {} names a nonexistent item", r.reference_type, r.from);
                return Err(Error::InvalidData(SubCode::NonexistingItemReferenced, "reference to a nonexistent item"));
            }
        }
        self.check_acyclic()
    }

    /// Depth-first search over the union of all reference types except 'prem',
    /// which points from a color item to its alpha and would close a loop with 'auxl'.
    fn check_acyclic(&self) -> Result<()> {
        let mut edges: BTreeMap<u32, std::vec::Vec<u32>> = BTreeMap::new();
        for (&(from, kind), to) in &self.forward {
            if kind != reference_type::PREMULTIPLIED {
                edges.entry(from).or_default().extend(to.iter().copied());
            }
        }

        let mut marks: BTreeMap<u32, Mark> = BTreeMap::new();
        for &start in edges.keys() {
            if marks.contains_key(&start) {
                continue;
            }
            let mut stack = vec![(start, 0usize)];
            marks.insert(start, Mark::InProgress);
            while let Some((node, next)) = stack.last_mut() {
                let targets = edges.get(node).map_or(&[][..], |t| &t[..]);
                if let Some(&target) = targets.get(*next) {
                    *next += 1;
                    match marks.get(&target) {
                        Some(Mark::InProgress) => {
                            warn!("item reference cycle through item {target}");
                            return Err(Error::InvalidData(SubCode::ItemReferenceCycle, "item references form a cycle"));
                        },
                        Some(Mark::Done) => {},
                        None => {
                            marks.insert(target, Mark::InProgress);
                            stack.push((target, 0));
                        },
                    }
                } else {
                    marks.insert(*node, Mark::Done);
                    stack.pop();
                }
            }
        }
        Ok(())
    }
}

/// See ISO 14496-12:2015 § 8.11.12
pub(crate) fn read_iref<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &ResourceTracker<'_>) -> Result<ReferenceGraph> {
    let mut graph = ReferenceGraph::default();
    let version = read_fullbox_version_no_flags(src, tracker)?;
    if version > 1 {
        return Err(Error::Unsupported(SubCode::UnsupportedDataVersion, "iref version"));
    }

    let mut iter = src.box_iter(tracker);
    while let Some(mut b) = iter.next_box()? {
        let from = if version == 0 {
            be_u16(&mut b)?.into()
        } else {
            be_u32(&mut b)?
        };
        let reference_count = be_u16(&mut b)?;
        let mut to = TryVec::with_capacity(reference_count.into())?;
        for _ in 0..reference_count {
            to.push(if version == 0 {
                be_u16(&mut b)?.into()
            } else {
                be_u32(&mut b)?
            })?;
        }
        check_parser_state(&b.head, &b.content)?;
        graph.insert(Reference {
            reference_type: b.head.name.into(),
            from,
            to,
        })?;
    }
    Ok(graph)
}

pub(crate) fn write_iref(out: &mut std::vec::Vec<u8>, graph: &ReferenceGraph) -> Result<()> {
    let wide = graph
        .references
        .iter()
        .any(|r| r.from > u32::from(u16::MAX) || r.to.iter().any(|&id| id > u32::from(u16::MAX)));
    write_full_box(out, BoxType::ItemReferenceBox.into(), u8::from(wide), 0, |iref| {
        for r in graph.references.iter() {
            write_box(iref, r.reference_type, |b| {
                let write_id = |b: &mut std::vec::Vec<u8>, id: u32| -> Result<()> {
                    if wide {
                        b.write_u32::<BigEndian>(id)?;
                    } else {
                        b.write_u16::<BigEndian>(u16::try_from(id)?)?;
                    }
                    Ok(())
                };
                write_id(b, r.from)?;
                b.write_u16::<BigEndian>(u16::try_from(r.to.len())?)?;
                for &id in r.to.iter() {
                    write_id(b, id)?;
                }
                Ok(())
            })?;
        }
        Ok(())
    })
}

#[cfg(test)]
fn catalog(ids: &[u32]) -> ItemCatalog {
    let items: std::vec::Vec<_> = ids.iter().map(|&id| crate::Item::new(id, crate::item_type::HEVC)).collect();
    ItemCatalog::new(items.into(), ids[0]).unwrap()
}

#[test]
fn iref_roundtrip() {
    let mut graph = ReferenceGraph::default();
    graph.add(reference_type::DERIVED_IMAGE, 1, &[3, 2, 4]).unwrap();
    graph.add(reference_type::THUMBNAIL, 5, &[1]).unwrap();

    let mut out = std::vec::Vec::new();
    write_iref(&mut out, &graph).unwrap();
    let config = crate::DecodeConfig::default();
    let tracker = ResourceTracker::new(&config);
    let mut cursor = &out[..];
    let head = crate::bmff::read_box_header(&mut cursor).unwrap();
    let mut b = BMFFBox {
        head,
        content: <_ as Read>::take(&mut cursor, head.size - head.offset),
    };
    let parsed = read_iref(&mut b, &tracker).unwrap();
    assert_eq!(parsed, graph);
    assert_eq!(parsed.references_from(1, reference_type::DERIVED_IMAGE).collect::<std::vec::Vec<_>>(), [3, 2, 4]);
    assert_eq!(parsed.references_to(1, reference_type::THUMBNAIL).collect::<std::vec::Vec<_>>(), [5]);
}

#[test]
fn boxes_with_the_same_key_append() {
    let mut graph = ReferenceGraph::default();
    graph.add(reference_type::DERIVED_IMAGE, 1, &[4, 2]).unwrap();
    graph.add(reference_type::THUMBNAIL, 1, &[7]).unwrap();
    graph.add(reference_type::DERIVED_IMAGE, 1, &[3]).unwrap();
    graph.add(reference_type::DERIVED_IMAGE, 5, &[2]).unwrap();

    assert_eq!(graph.references().len(), 4);
    assert_eq!(graph.references_from(1, reference_type::DERIVED_IMAGE).collect::<std::vec::Vec<_>>(), [4, 2, 3]);
    assert_eq!(graph.references_from(1, reference_type::THUMBNAIL).collect::<std::vec::Vec<_>>(), [7]);
    assert_eq!(graph.references_to(2, reference_type::DERIVED_IMAGE).collect::<std::vec::Vec<_>>(), [1, 5]);
    assert!(graph.references_from(2, reference_type::DERIVED_IMAGE).next().is_none());
    assert!(!graph.has_references(7, reference_type::THUMBNAIL));
}

#[test]
fn cycles_are_rejected() {
    let items = catalog(&[1, 2, 3]);
    let mut graph = ReferenceGraph::default();
    graph.add(reference_type::DERIVED_IMAGE, 1, &[2]).unwrap();
    graph.add(reference_type::DERIVED_IMAGE, 2, &[3]).unwrap();
    graph.validate(&items).unwrap();

    graph.add(reference_type::AUXILIARY, 3, &[1]).unwrap();
    let err = graph.validate(&items).unwrap_err();
    assert_eq!(err.subcode(), SubCode::ItemReferenceCycle);

    let mut selfref = ReferenceGraph::default();
    selfref.add(reference_type::DERIVED_IMAGE, 2, &[2]).unwrap();
    assert_eq!(selfref.validate(&items).unwrap_err().subcode(), SubCode::ItemReferenceCycle);
}

#[test]
fn alpha_premultiplied_is_not_a_cycle() {
    let items = catalog(&[1, 2]);
    let mut graph = ReferenceGraph::default();
    graph.add(reference_type::AUXILIARY, 2, &[1]).unwrap();
    graph.add(reference_type::PREMULTIPLIED, 1, &[2]).unwrap();
    graph.validate(&items).unwrap();
}

#[test]
fn dangling_reference() {
    let items = catalog(&[1]);
    let mut graph = ReferenceGraph::default();
    graph.add(reference_type::CONTENT_DESCRIBES, 1, &[9]).unwrap();
    assert_eq!(graph.validate(&items).unwrap_err().subcode(), SubCode::NonexistingItemReferenced);
}
