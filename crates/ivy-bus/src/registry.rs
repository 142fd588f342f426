//! Two-sided subscription registry.
//!
//! *Ours*: subscription id → (regexp string, callback), ids strictly
//! monotonic and never reused.  *Theirs*: regexp string → compiled pattern
//! plus every (peer, remote id) bound to it, so one shared regexp is
//! compiled exactly once no matter how many peers subscribe with it.
//!
//! The registry itself is not synchronized; the agent keeps it inside its
//! single state mutex.  Regex compilation happens outside that lock — see
//! the two-step `has_binding` / `bind` dance in the connection handler.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::callbacks::MsgCallback;
use crate::peer::Peer;

/// All peers bound to one regexp.
pub(crate) struct ClientsBinding {
    pub pattern: Regex,
    pub clients: Vec<(Arc<Peer>, i64)>,
}

pub(crate) struct OwnSubscription {
    pub regexp: String,
    pub callback: MsgCallback,
}

#[derive(Default)]
pub(crate) struct Registry {
    subscriptions: HashMap<u32, OwnSubscription>,
    next_sub_id: u32,
    bindings: HashMap<String, ClientsBinding>,
}

impl Registry {
    // -- our subscriptions --------------------------------------------------

    /// Register a subscription and return its id.  Ids are unique for the
    /// lifetime of the agent, holes included.
    pub fn add_subscription(&mut self, regexp: &str, callback: MsgCallback) -> u32 {
        let id = self.next_sub_id;
        self.next_sub_id += 1;
        self.subscriptions.insert(
            id,
            OwnSubscription {
                regexp: regexp.to_owned(),
                callback,
            },
        );
        id
    }

    /// Remove a subscription, yielding its regexp.
    pub fn remove_subscription(&mut self, id: u32) -> Option<String> {
        self.subscriptions.remove(&id).map(|s| s.regexp)
    }

    pub fn subscription(&self, id: u32) -> Option<(String, MsgCallback)> {
        self.subscriptions
            .get(&id)
            .map(|s| (s.regexp.clone(), s.callback.clone()))
    }

    pub fn subscriptions(&self) -> Vec<(u32, String)> {
        self.subscriptions
            .iter()
            .map(|(id, s)| (*id, s.regexp.clone()))
            .collect()
    }

    // -- peer bindings ------------------------------------------------------

    /// Append `(peer, remote_id)` to an existing binding for `regexp`.
    /// Returns false when no binding exists yet (the caller then compiles
    /// the pattern outside the lock and calls [`Registry::bind`]).
    pub fn try_append(&mut self, peer: &Arc<Peer>, remote_id: i64, regexp: &str) -> bool {
        match self.bindings.get_mut(regexp) {
            Some(binding) => {
                binding.clients.push((peer.clone(), remote_id));
                true
            }
            None => false,
        }
    }

    /// Record a binding with its freshly compiled pattern.  If another
    /// handler raced us to the same regexp, the entry is appended and the
    /// extra compile is discarded.
    pub fn bind(&mut self, peer: &Arc<Peer>, remote_id: i64, regexp: &str, pattern: Regex) {
        self.bindings
            .entry(regexp.to_owned())
            .or_insert_with(|| ClientsBinding {
                pattern,
                clients: Vec::new(),
            })
            .clients
            .push((peer.clone(), remote_id));
    }

    /// Remove one `(peer, remote_id)` binding and return its regexp.
    pub fn unbind(&mut self, peer: &Arc<Peer>, remote_id: i64) -> Option<String> {
        let mut found: Option<String> = None;
        for (regexp, binding) in &mut self.bindings {
            if let Some(pos) = binding
                .clients
                .iter()
                .position(|(p, id)| *id == remote_id && p.as_ref() == peer.as_ref())
            {
                binding.clients.remove(pos);
                found = Some(regexp.clone());
                break;
            }
        }
        if let Some(ref regexp) = found {
            if self.bindings[regexp].clients.is_empty() {
                self.bindings.remove(regexp);
            }
        }
        found
    }

    /// Purge every binding held by `peer`.
    pub fn unbind_all(&mut self, peer: &Arc<Peer>) {
        for binding in self.bindings.values_mut() {
            binding
                .clients
                .retain(|(p, _)| p.as_ref() != peer.as_ref());
        }
        self.bindings.retain(|_, b| !b.clients.is_empty());
    }

    /// Drop every peer binding; used on agent shutdown.  Our own
    /// subscriptions survive a stop/start cycle.
    pub fn clear_bindings(&mut self) {
        self.bindings.clear();
    }

    /// The subscriptions one peer holds, as `(remote_id, regexp)` pairs.
    pub fn bindings_of(&self, peer: &Arc<Peer>) -> Vec<(i64, String)> {
        let mut out = Vec::new();
        for (regexp, binding) in &self.bindings {
            for (p, id) in &binding.clients {
                if p.as_ref() == peer.as_ref() {
                    out.push((*id, regexp.clone()));
                }
            }
        }
        out
    }

    /// Snapshot every binding for dispatch outside the lock.  `Regex`
    /// clones share the compiled program; the client lists clone `Arc`s.
    pub fn snapshot_bindings(&self) -> Vec<(Regex, Vec<(Arc<Peer>, i64)>)> {
        self.bindings
            .values()
            .map(|b| (b.pattern.clone(), b.clients.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
