//! View State projection for smartmarks.
//!
//! Synchronous bookkeeping behind the reconciler: every completed remote call
//! and every feed event is applied here as one atomic step. Nothing in this
//! module awaits.
//!
//! Results carry the identity generation they were issued under. Anything
//! tagged with an older generation belongs to a previous session and is
//! discarded.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::types::bookmark::{Bookmark, BookmarkId};
use crate::types::errors::BookmarkError;
use crate::types::feed::ChangeEvent;
use crate::types::session::Identity;
use crate::types::view::{FormFields, ViewPhase, ViewState};

/// The reconciler's private model, projected into a [`ViewState`].
#[derive(Debug, Default)]
pub struct ViewProjection {
    state: ViewState,
    generation: u64,
    in_flight: usize,
    /// Bumped on every change to the list after the initial load.
    epoch: u64,
    /// Ids deleted during this session. Ids are never reused, so a late
    /// insert, update or list row for one of these is stale.
    tombstones: HashSet<BookmarkId>,
    /// Feed events that arrived before the initial list.
    backlog: Vec<ChangeEvent>,
}

impl ViewProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.state.identity.as_ref()
    }

    pub fn phase(&self) -> ViewPhase {
        self.state.phase
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Tag for a list read issued now; see [`apply_refresh`](Self::apply_refresh).
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// Moves to a new identity. Returns `false` when nothing changed.
    ///
    /// Any identity change starts a fresh session: the list, form, tombstones
    /// and in-flight count are reset and the generation is bumped.
    pub fn set_identity(&mut self, identity: Option<Identity>) -> bool {
        if self.state.identity == identity {
            return false;
        }
        self.generation += 1;
        self.in_flight = 0;
        self.epoch = 0;
        self.tombstones.clear();
        self.backlog.clear();
        self.state = ViewState {
            phase: if identity.is_some() {
                ViewPhase::LoadingInitial
            } else {
                ViewPhase::SignedOut
            },
            identity,
            bookmarks: Vec::new(),
            pending: false,
            form: FormFields::default(),
        };
        true
    }

    /// Applies the initial list and replays buffered feed events.
    /// Returns `false` if the result is stale and was discarded.
    pub fn apply_initial_list(
        &mut self,
        generation: u64,
        identity: &Identity,
        rows: Vec<Bookmark>,
    ) -> bool {
        if !self.is_current(generation)
            || self.state.identity.as_ref() != Some(identity)
            || self.state.phase != ViewPhase::LoadingInitial
        {
            return false;
        }
        self.state.bookmarks = self.dedup_rows(rows);
        self.settle();
        for event in std::mem::take(&mut self.backlog) {
            self.apply_change(event);
        }
        true
    }

    /// Applies a re-read issued at `issued_at` (see [`epoch`](Self::epoch)).
    /// Returns `false` if stale.
    ///
    /// If nothing changed since the read was issued, the list is replaced.
    /// Otherwise the changes applied in between win: entries the read did not
    /// see are kept in front, and entries both know keep their newer version.
    pub fn apply_refresh(
        &mut self,
        generation: u64,
        identity: &Identity,
        issued_at: u64,
        rows: Vec<Bookmark>,
    ) -> bool {
        if !self.is_current(generation)
            || self.state.identity.as_ref() != Some(identity)
            || !matches!(self.state.phase, ViewPhase::Ready | ViewPhase::Mutating)
        {
            return false;
        }
        let fresh = self.dedup_rows(rows);
        if issued_at == self.epoch {
            self.state.bookmarks = fresh;
            return true;
        }

        debug!(issued_at, epoch = self.epoch, "merging refresh that overlapped local changes");
        let read_ids: HashSet<&BookmarkId> = fresh.iter().map(|b| &b.id).collect();
        let mut merged: Vec<Bookmark> = self
            .state
            .bookmarks
            .iter()
            .filter(|b| !read_ids.contains(&b.id))
            .cloned()
            .collect();
        let mut newer: HashMap<&BookmarkId, &Bookmark> =
            self.state.bookmarks.iter().map(|b| (&b.id, b)).collect();
        merged.extend(
            fresh
                .iter()
                .map(|b| newer.remove(&b.id).unwrap_or(b).clone()),
        );
        self.state.bookmarks = merged;
        true
    }

    fn dedup_rows(&self, rows: Vec<Bookmark>) -> Vec<Bookmark> {
        let mut seen = HashSet::new();
        rows.into_iter()
            .filter(|b| !self.tombstones.contains(&b.id) && seen.insert(b.id.clone()))
            .collect()
    }

    /// Applies a feed event. Returns `false` if it was stale or ignored.
    pub fn apply_event(&mut self, generation: u64, event: ChangeEvent) -> bool {
        if !self.is_current(generation) {
            debug!(generation, current = self.generation, "dropping stale feed event");
            return false;
        }
        match self.state.phase {
            ViewPhase::SignedOut => false,
            ViewPhase::LoadingInitial => {
                self.backlog.push(event);
                true
            }
            ViewPhase::Ready | ViewPhase::Mutating => self.apply_change(event),
        }
    }

    fn apply_change(&mut self, event: ChangeEvent) -> bool {
        match event {
            ChangeEvent::Insert(bookmark) => self.upsert_front(bookmark),
            ChangeEvent::Update(bookmark) => self.replace(bookmark),
            ChangeEvent::Delete(id) => {
                self.remove(&id);
                true
            }
        }
    }

    /// Prepends, or replaces in place if the id is already listed.
    fn upsert_front(&mut self, bookmark: Bookmark) -> bool {
        if self.tombstones.contains(&bookmark.id) || Some(&bookmark.owner) != self.identity() {
            return false;
        }
        if !self.replace(bookmark.clone()) {
            self.state.bookmarks.insert(0, bookmark);
            self.epoch += 1;
        }
        true
    }

    /// Replaces the entry with the same id, keeping its position.
    fn replace(&mut self, bookmark: Bookmark) -> bool {
        if self.tombstones.contains(&bookmark.id) {
            return false;
        }
        match self.state.bookmarks.iter_mut().find(|b| b.id == bookmark.id) {
            Some(slot) => {
                *slot = bookmark;
                self.epoch += 1;
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &BookmarkId) {
        self.epoch += 1;
        self.tombstones.insert(id.clone());
        self.state.bookmarks.retain(|b| &b.id != id);
    }

    /// Admits a create/delete. Returns the generation to tag its result with.
    pub fn begin_mutation(&mut self) -> Result<u64, BookmarkError> {
        match self.state.phase {
            ViewPhase::SignedOut => Err(BookmarkError::NotSignedIn),
            ViewPhase::LoadingInitial => Err(BookmarkError::NotReady),
            ViewPhase::Ready | ViewPhase::Mutating => {
                self.in_flight += 1;
                self.settle();
                Ok(self.generation)
            }
        }
    }

    /// Marks one mutation of `generation` as finished, whatever its result.
    pub fn finish_mutation(&mut self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        self.in_flight = self.in_flight.saturating_sub(1);
        self.settle();
    }

    fn settle(&mut self) {
        if self.state.identity.is_none() {
            return;
        }
        self.state.pending = self.in_flight > 0;
        self.state.phase = if self.in_flight > 0 {
            ViewPhase::Mutating
        } else {
            ViewPhase::Ready
        };
    }

    /// Applies a successful create and clears the form.
    pub fn apply_created(&mut self, generation: u64, bookmark: Bookmark) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.state.form = FormFields::default();
        self.upsert_front(bookmark)
    }

    /// Applies a successful delete.
    pub fn apply_deleted(&mut self, generation: u64, id: &BookmarkId) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.remove(id);
        true
    }

    /// Updates the form. `None` leaves a field as it is.
    pub fn set_form(&mut self, title: Option<String>, url: Option<String>) {
        if let Some(title) = title {
            self.state.form.title = title;
        }
        if let Some(url) = url {
            self.state.form.url = url;
        }
    }
}
