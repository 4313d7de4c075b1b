use std::collections::HashMap;

use tracing::debug;

use crate::candidates::CandidateBuffer;
use crate::negotiation::PeerLink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// A participant first seen through an offer, before any join named it.
    pub fn unnamed(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
        }
    }
}

/// Sole owner of peer lifecycle: one link per remote participant, plus the
/// candidates buffered for participants whose description is not set yet.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    links: HashMap<String, PeerLink>,
    candidates: CandidateBuffer,
    next_link_id: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_link_id(&mut self) -> u64 {
        self.next_link_id += 1;
        self.next_link_id
    }

    /// Inserts `link` unless its participant already has one. On a duplicate
    /// the spare link is closed and the existing one is returned.
    pub fn upsert(&mut self, mut link: PeerLink) -> (&mut PeerLink, bool) {
        let id = link.participant().id.clone();
        let created = !self.links.contains_key(&id);
        if !created {
            debug!(peer = %id, "link already exists, discarding duplicate");
            link.close();
        }
        let entry = self.links.entry(id).or_insert(link);
        (entry, created)
    }

    /// Puts `link` in place of the participant's current link, which is
    /// closed. Buffered candidates are kept for the new link.
    pub fn replace(&mut self, link: PeerLink) -> Option<PeerLink> {
        let id = link.participant().id.clone();
        let mut previous = self.links.insert(id, link)?;
        previous.close();
        Some(previous)
    }

    /// Closes the handle, forgets buffered candidates and drops the link in
    /// one step.
    pub fn remove(&mut self, participant_id: &str) -> Option<PeerLink> {
        self.candidates.discard(participant_id);
        let mut link = self.links.remove(participant_id)?;
        link.close();
        Some(link)
    }

    /// Closes and removes every link.
    pub fn drain_all(&mut self) -> Vec<PeerLink> {
        self.candidates.clear();
        self.links
            .drain()
            .map(|(_, mut link)| {
                link.close();
                link
            })
            .collect()
    }

    pub fn rename(&mut self, participant_id: &str, display_name: &str) {
        if display_name.is_empty() {
            return;
        }
        if let Some(link) = self.links.get_mut(participant_id) {
            link.participant_mut().display_name = display_name.to_string();
        }
    }

    pub fn for_each(&self, mut f: impl FnMut(&PeerLink)) {
        self.links.values().for_each(|link| f(link));
    }

    pub fn get(&self, participant_id: &str) -> Option<&PeerLink> {
        self.links.get(participant_id)
    }

    pub fn get_mut(&mut self, participant_id: &str) -> Option<&mut PeerLink> {
        self.links.get_mut(participant_id)
    }

    /// The link for `participant_id`, provided it is still `link_id`.
    pub fn get_current(&mut self, participant_id: &str, link_id: u64) -> Option<&mut PeerLink> {
        self.links
            .get_mut(participant_id)
            .filter(|link| link.link_id() == link_id)
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.links.contains_key(participant_id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn participants(&self) -> Vec<Participant> {
        let mut participants: Vec<_> = self.links.values().map(|l| l.participant().clone()).collect();
        participants.sort_by(|a, b| a.id.cmp(&b.id));
        participants
    }

    pub fn candidates(&self) -> &CandidateBuffer {
        &self.candidates
    }

    pub fn candidates_mut(&mut self) -> &mut CandidateBuffer {
        &mut self.candidates
    }
}
