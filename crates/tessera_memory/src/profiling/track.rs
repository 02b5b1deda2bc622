//! # Track Format
//!
//! A track is a snapshot plus the ordered events recorded after it: the unit
//! handed to external viewers.
//!
//! ## Format
//!
//! All integers little-endian.
//!
//! ```text
//! [4 bytes: magic "TMTR"]
//! [4 bytes: version]
//!
//! Header:
//! [4 bytes: group count] [4 bytes: root group id] [8 bytes: snapshot sequence]
//!
//! Group entry:
//! [4 bytes: id] [4 bytes: parent id, 0xFFFFFFFF = none]
//! [4 bytes: name length] [N bytes: name, utf-8]
//! [8 bytes: reserved bytes] [8 bytes: used bytes]
//!
//! [4 bytes: event count]
//!
//! Event entry:
//! [8 bytes: sequence] [4 bytes: group id] [1 byte: kind]
//! [8 bytes: size, signed] [8 bytes: timestamp ns]
//! ```

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};

use super::event::{Event, EventKind};
use super::group::{GroupCounters, GroupId, GroupRecord};
use crate::error::{TrackError, TrackResult};

/// Magic bytes identifying a track file.
pub const TRACK_MAGIC: &[u8; 4] = b"TMTR";

/// Current track format version.
pub const TRACK_VERSION: u32 = 1;

/// Longest group name accepted when reading.
const MAX_NAME_LEN: usize = 64 * 1024;

/// Upper bound on entries preallocated from an untrusted count.
const MAX_PREALLOC: usize = 4096;

/// Snapshot plus subsequent events.
///
/// Every `Track` value satisfies the validation rules of
/// [`read_from`](Self::read_from): tracks are only built by the profiler or
/// by a successful read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Track {
    snapshot_sequence: u64,
    root: GroupId,
    groups: Vec<GroupRecord>,
    events: Vec<Event>,
}

impl Track {
    pub(crate) fn from_parts(snapshot_sequence: u64, root: GroupId, groups: Vec<GroupRecord>, events: Vec<Event>) -> Self {
        Self {
            snapshot_sequence,
            root,
            groups,
            events,
        }
    }

    /// Sequence number the group counters were captured at.
    #[inline]
    #[must_use]
    pub const fn snapshot_sequence(&self) -> u64 {
        self.snapshot_sequence
    }

    /// Root group id.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> GroupId {
        self.root
    }

    /// Groups with their counters at the snapshot.
    #[inline]
    #[must_use]
    pub fn groups(&self) -> &[GroupRecord] {
        &self.groups
    }

    /// Events after the snapshot, ascending by sequence.
    #[inline]
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Sequence of the last event, or the snapshot sequence if there is none.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.events.last().map_or(self.snapshot_sequence, |e| e.sequence)
    }

    /// Replays every event onto the snapshot counters.
    #[must_use]
    pub fn replay(&self) -> Vec<GroupRecord> {
        self.replay_until(u64::MAX)
    }

    /// Replays events with `sequence <= until` onto the snapshot counters.
    ///
    /// The result equals the live counters at the moment event `until` was
    /// recorded.
    #[must_use]
    pub fn replay_until(&self, until: u64) -> Vec<GroupRecord> {
        let mut groups = self.groups.clone();
        let index: HashMap<GroupId, usize> = groups.iter().enumerate().map(|(i, g)| (g.id, i)).collect();
        for event in self.events.iter().take_while(|e| e.sequence <= until) {
            if let Some(&slot) = index.get(&event.group) {
                groups[slot].counters.apply(event.kind, event.size);
            }
        }
        groups
    }

    /// Serializes the track.
    ///
    /// # Errors
    ///
    /// `Io` on writer failure, `TooLarge` if a section exceeds `u32` entries.
    pub fn write_to<W: Write>(&self, out: &mut W) -> TrackResult<()> {
        out.write_all(TRACK_MAGIC)?;
        out.write_all(&TRACK_VERSION.to_le_bytes())?;

        out.write_all(&count_u32(self.groups.len())?.to_le_bytes())?;
        out.write_all(&self.root.get().to_le_bytes())?;
        out.write_all(&self.snapshot_sequence.to_le_bytes())?;

        for group in &self.groups {
            out.write_all(&group.id.get().to_le_bytes())?;
            out.write_all(&group.parent.map_or(GroupId::NONE, GroupId::get).to_le_bytes())?;
            out.write_all(&count_u32(group.name.len())?.to_le_bytes())?;
            out.write_all(group.name.as_bytes())?;
            out.write_all(&group.counters.reserved.to_le_bytes())?;
            out.write_all(&group.counters.used.to_le_bytes())?;
        }

        out.write_all(&count_u32(self.events.len())?.to_le_bytes())?;
        for event in &self.events {
            out.write_all(&event.sequence.to_le_bytes())?;
            out.write_all(&event.group.get().to_le_bytes())?;
            out.write_all(&[event.kind as u8])?;
            out.write_all(&event.size.to_le_bytes())?;
            out.write_all(&event.timestamp_ns.to_le_bytes())?;
        }
        out.flush()?;
        Ok(())
    }

    /// Deserializes and validates a track.
    ///
    /// # Errors
    ///
    /// Rejects bad magic, unknown versions and event kinds, invalid names,
    /// duplicate group ids, unknown parents, a missing root, events out of
    /// sequence order (or not after the snapshot), events on unknown groups
    /// and `GroupCreated` events that do not match a fresh group.
    pub fn read_from<R: Read>(input: &mut R) -> TrackResult<Self> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if &magic != TRACK_MAGIC {
            return Err(TrackError::BadMagic);
        }
        let version = read_u32(input)?;
        if version == 0 || version > TRACK_VERSION {
            return Err(TrackError::UnsupportedVersion(version));
        }

        let group_count = read_u32(input)? as usize;
        let root = GroupId(read_u32(input)?);
        let snapshot_sequence = read_u64(input)?;

        let mut groups = Vec::with_capacity(group_count.min(MAX_PREALLOC));
        for _ in 0..group_count {
            let id = GroupId(read_u32(input)?);
            let parent = match read_u32(input)? {
                GroupId::NONE => None,
                raw => Some(GroupId(raw)),
            };
            let name_len = read_u32(input)? as usize;
            if name_len > MAX_NAME_LEN {
                return Err(TrackError::TooLarge(name_len));
            }
            let mut name = vec![0u8; name_len];
            input.read_exact(&mut name)?;
            let name = String::from_utf8(name).map_err(|_| TrackError::InvalidName)?;
            let counters = GroupCounters {
                reserved: read_u64(input)?,
                used: read_u64(input)?,
            };
            groups.push(GroupRecord {
                id,
                parent,
                name,
                counters,
            });
        }

        let event_count = read_u32(input)? as usize;
        let mut events = Vec::with_capacity(event_count.min(MAX_PREALLOC));
        for _ in 0..event_count {
            let sequence = read_u64(input)?;
            let group = GroupId(read_u32(input)?);
            let mut kind = [0u8; 1];
            input.read_exact(&mut kind)?;
            let kind = EventKind::from_u8(kind[0]).ok_or(TrackError::InvalidEventKind(kind[0]))?;
            let size = read_i64(input)?;
            let timestamp_ns = read_u64(input)?;
            events.push(Event {
                sequence,
                group,
                kind,
                size,
                timestamp_ns,
            });
        }

        let track = Self::from_parts(snapshot_sequence, root, groups, events);
        track.validate()?;
        Ok(track)
    }

    fn validate(&self) -> TrackResult<()> {
        let mut ids = HashMap::with_capacity(self.groups.len());
        for group in &self.groups {
            if ids.insert(group.id, group).is_some() {
                return Err(TrackError::DuplicateGroup(group.id.get()));
            }
        }
        for group in &self.groups {
            if let Some(parent) = group.parent {
                if !ids.contains_key(&parent) {
                    return Err(TrackError::UnknownParent {
                        group: group.id.get(),
                        parent: parent.get(),
                    });
                }
            }
        }
        if !ids.get(&self.root).is_some_and(|root| root.parent.is_none()) {
            return Err(TrackError::MissingRoot(self.root.get()));
        }

        let mut children: HashMap<GroupId, Vec<&GroupRecord>> = HashMap::new();
        for group in &self.groups {
            if let Some(parent) = group.parent {
                children.entry(parent).or_default().push(group);
            }
        }
        let mut reached = HashSet::from([self.root]);
        let mut pending = vec![self.root];
        while let Some(parent) = pending.pop() {
            let mut names = HashSet::new();
            for child in children.get(&parent).into_iter().flatten() {
                if !names.insert(child.name.as_str()) {
                    return Err(TrackError::DuplicateName {
                        parent: parent.get(),
                        name: child.name.clone(),
                    });
                }
                if reached.insert(child.id) {
                    pending.push(child.id);
                }
            }
        }
        if let Some(lost) = self.groups.iter().find(|g| !reached.contains(&g.id)) {
            return Err(TrackError::Unreachable(lost.id.get()));
        }

        let mut previous = self.snapshot_sequence;
        let mut created = HashSet::new();
        for event in &self.events {
            if event.sequence <= previous {
                return Err(TrackError::OutOfOrder {
                    previous,
                    sequence: event.sequence,
                });
            }
            previous = event.sequence;

            let group = ids.get(&event.group);
            if event.kind == EventKind::GroupCreated {
                let fresh = group.is_some_and(|g| g.parent.is_some() && g.counters.is_zero());
                if !fresh || !created.insert(event.group) {
                    return Err(TrackError::GroupCreatedMismatch {
                        sequence: event.sequence,
                        group: event.group.get(),
                    });
                }
            } else if group.is_none() {
                return Err(TrackError::UnknownGroup {
                    sequence: event.sequence,
                    group: event.group.get(),
                });
            }
        }
        Ok(())
    }
}

fn count_u32(len: usize) -> TrackResult<u32> {
    u32::try_from(len).map_err(|_| TrackError::TooLarge(len))
}

fn read_u32<R: Read>(input: &mut R) -> TrackResult<u32> {
    let mut bytes = [0u8; 4];
    input.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64<R: Read>(input: &mut R) -> TrackResult<u64> {
    let mut bytes = [0u8; 8];
    input.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_i64<R: Read>(input: &mut R) -> TrackResult<i64> {
    let mut bytes = [0u8; 8];
    input.read_exact(&mut bytes)?;
    Ok(i64::from_le_bytes(bytes))
}
