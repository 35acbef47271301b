//! Pending-operation table: message ID → in-flight entry.
//!
//! The only structure touched concurrently from multiple actors (send path
//! registers, read path completes, any task cancels). Removal from the map
//! is the single-permit completion gate: whoever atomically removes an entry
//! owns its one completion, so a cancel racing a response yields exactly one
//! outcome. Outcomes cross tokio channels, so user code never runs on the
//! connection's I/O task.

use crate::error::LdapError;
use crate::protocol::{
    BindResponse, ExtendedResponse, LdapResult, SearchResultEntry, SearchResultReference,
};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

/// Expected response family for a registered request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Bind,
    Search,
    Modify,
    Add,
    Delete,
    ModifyDn,
    Compare,
    Extended,
}

impl ResponseKind {
    pub fn name(self) -> &'static str {
        match self {
            ResponseKind::Bind => "bind",
            ResponseKind::Search => "search",
            ResponseKind::Modify => "modify",
            ResponseKind::Add => "add",
            ResponseKind::Delete => "delete",
            ResponseKind::ModifyDn => "modify dn",
            ResponseKind::Compare => "compare",
            ResponseKind::Extended => "extended",
        }
    }
}

/// Terminal payload delivered to a completed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Bind(BindResponse),
    SearchDone(LdapResult),
    Modify(LdapResult),
    Add(LdapResult),
    Delete(LdapResult),
    ModifyDn(LdapResult),
    Compare(LdapResult),
    Extended(ExtendedResponse),
}

impl ResponseBody {
    pub fn kind(&self) -> ResponseKind {
        match self {
            ResponseBody::Bind(_) => ResponseKind::Bind,
            ResponseBody::SearchDone(_) => ResponseKind::Search,
            ResponseBody::Modify(_) => ResponseKind::Modify,
            ResponseBody::Add(_) => ResponseKind::Add,
            ResponseBody::Delete(_) => ResponseKind::Delete,
            ResponseBody::ModifyDn(_) => ResponseKind::ModifyDn,
            ResponseBody::Compare(_) => ResponseKind::Compare,
            ResponseBody::Extended(_) => ResponseKind::Extended,
        }
    }
}

pub type OpOutcome = Result<ResponseBody, LdapError>;

/// Streamed search data delivered before the terminal done result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchItem {
    Entry(SearchResultEntry),
    Reference(SearchResultReference),
}

/// Terminal search outcome with the streamed-item tallies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOutcome {
    pub result: LdapResult,
    pub entry_count: u32,
    pub reference_count: u32,
}

enum Completer {
    /// One response completes the operation.
    Single(oneshot::Sender<OpOutcome>),
    /// Entries/references stream out before the terminal done result.
    Search {
        items: mpsc::UnboundedSender<SearchItem>,
        done: oneshot::Sender<Result<SearchOutcome, LdapError>>,
        entry_count: u32,
        reference_count: u32,
    },
    /// One bind future spans several wire round-trips; the channel is
    /// multi-shot and the sequencer removes the entry on the final leg.
    Bind(mpsc::UnboundedSender<Result<BindResponse, LdapError>>),
}

struct PendingEntry {
    expected: ResponseKind,
    completer: Completer,
}

impl PendingEntry {
    /// Fire the entry's failure path. Consumes the entry; send failures mean
    /// the caller lost interest, which is fine.
    fn fail(self, err: LdapError) {
        match self.completer {
            Completer::Single(tx) => {
                let _ = tx.send(Err(err));
            }
            Completer::Search { done, .. } => {
                let _ = done.send(Err(err));
            }
            Completer::Bind(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// Outcome of routing a response into the table.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteStatus {
    /// Delivered to (or completed) the matching entry.
    Delivered,
    /// No entry: a late response for a cancelled/closed operation. Dropped.
    NotFound,
    /// Entry kind disagrees with the response; the entry has been failed
    /// and the connection must close.
    Mismatch { expected: ResponseKind },
}

#[derive(Default)]
pub struct PendingTable {
    map: DashMap<i32, PendingEntry>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, message_id: i32) -> bool {
        self.map.contains_key(&message_id)
    }

    /// Register a single-response operation. The caller (send path) owns
    /// message-id uniqueness.
    pub fn register(&self, message_id: i32, expected: ResponseKind) -> oneshot::Receiver<OpOutcome> {
        let (tx, rx) = oneshot::channel();
        self.map.insert(
            message_id,
            PendingEntry {
                expected,
                completer: Completer::Single(tx),
            },
        );
        rx
    }

    /// Register a search: a stream of items plus the terminal outcome.
    #[allow(clippy::type_complexity)]
    pub fn register_search(
        &self,
        message_id: i32,
    ) -> (
        mpsc::UnboundedReceiver<SearchItem>,
        oneshot::Receiver<Result<SearchOutcome, LdapError>>,
    ) {
        let (items_tx, items_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        self.map.insert(
            message_id,
            PendingEntry {
                expected: ResponseKind::Search,
                completer: Completer::Search {
                    items: items_tx,
                    done: done_tx,
                    entry_count: 0,
                    reference_count: 0,
                },
            },
        );
        (items_rx, done_rx)
    }

    /// Register a bind; the receiver sees every leg of the exchange.
    pub fn register_bind(
        &self,
        message_id: i32,
    ) -> mpsc::UnboundedReceiver<Result<BindResponse, LdapError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.map.insert(
            message_id,
            PendingEntry {
                expected: ResponseKind::Bind,
                completer: Completer::Bind(tx),
            },
        );
        rx
    }

    /// Complete an entry with a terminal response body. Removes the entry;
    /// a second completion for the same id finds nothing and is a no-op.
    pub fn complete(&self, message_id: i32, body: ResponseBody) -> RouteStatus {
        let got = body.kind();
        let Some((_, entry)) = self.map.remove(&message_id) else {
            return RouteStatus::NotFound;
        };
        if entry.expected != got {
            let expected = entry.expected;
            entry.fail(LdapError::KindMismatch {
                message_id,
                expected: expected.name(),
                got: got.name(),
            });
            return RouteStatus::Mismatch { expected };
        }
        match entry.completer {
            Completer::Single(tx) => {
                let _ = tx.send(Ok(body));
            }
            Completer::Search {
                done,
                entry_count,
                reference_count,
                ..
            } => {
                let ResponseBody::SearchDone(result) = body else {
                    unreachable!("kind check admits only SearchDone here");
                };
                let _ = done.send(Ok(SearchOutcome {
                    result,
                    entry_count,
                    reference_count,
                }));
            }
            Completer::Bind(tx) => {
                let ResponseBody::Bind(response) = body else {
                    unreachable!("kind check admits only Bind here");
                };
                let _ = tx.send(Ok(response));
            }
        }
        RouteStatus::Delivered
    }

    /// Deliver one bind-exchange leg without removing the entry; the bind
    /// sequencer removes it after the final leg.
    pub fn push_bind_response(&self, message_id: i32, response: BindResponse) -> RouteStatus {
        {
            let Some(entry) = self.map.get(&message_id) else {
                return RouteStatus::NotFound;
            };
            if let Completer::Bind(tx) = &entry.completer {
                let _ = tx.send(Ok(response));
                return RouteStatus::Delivered;
            }
        }
        // A bind response for a non-bind entry: fail it and report.
        let Some((_, entry)) = self.map.remove(&message_id) else {
            return RouteStatus::NotFound;
        };
        let expected = entry.expected;
        entry.fail(LdapError::KindMismatch {
            message_id,
            expected: expected.name(),
            got: ResponseKind::Bind.name(),
        });
        RouteStatus::Mismatch { expected }
    }

    /// Deliver a streamed search entry/reference, bumping the tallies.
    pub fn push_search_item(&self, message_id: i32, item: SearchItem) -> RouteStatus {
        {
            let Some(mut entry) = self.map.get_mut(&message_id) else {
                return RouteStatus::NotFound;
            };
            if let Completer::Search {
                items,
                entry_count,
                reference_count,
                ..
            } = &mut entry.completer
            {
                match &item {
                    SearchItem::Entry(_) => *entry_count += 1,
                    SearchItem::Reference(_) => *reference_count += 1,
                }
                let _ = items.send(item);
                return RouteStatus::Delivered;
            }
        }
        let Some((_, entry)) = self.map.remove(&message_id) else {
            return RouteStatus::NotFound;
        };
        let expected = entry.expected;
        entry.fail(LdapError::KindMismatch {
            message_id,
            expected: expected.name(),
            got: ResponseKind::Search.name(),
        });
        RouteStatus::Mismatch { expected }
    }

    /// Remove the entry without completing it. Used by the bind sequencer
    /// once the final leg has been delivered through the multi-shot channel.
    pub fn remove(&self, message_id: i32) -> bool {
        self.map.remove(&message_id).is_some()
    }

    /// Fail one entry with an explicit error (e.g. a send attempted after
    /// close replays the close reason).
    pub fn fail(&self, message_id: i32, err: LdapError) -> bool {
        match self.map.remove(&message_id) {
            Some((_, entry)) => {
                entry.fail(err);
                true
            }
            None => false,
        }
    }

    /// Cancel a pending operation: the local future completes as cancelled
    /// immediately. Returns the entry's kind when one was present.
    pub fn cancel(&self, message_id: i32) -> Option<ResponseKind> {
        let (_, entry) = self.map.remove(&message_id)?;
        let kind = entry.expected;
        entry.fail(LdapError::Cancelled);
        Some(kind)
    }

    /// Fail every remaining entry with `reason`. Returns what was drained so
    /// the connection can send best-effort abandons for non-bind entries.
    pub fn drain(&self, reason: &LdapError) -> Vec<(i32, ResponseKind)> {
        let ids: Vec<i32> = self.map.iter().map(|e| *e.key()).collect();
        let mut drained = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, entry)) = self.map.remove(&id) {
                drained.push((id, entry.expected));
                entry.fail(reason.clone());
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResultCode;
    use std::sync::Arc;

    fn ok_result() -> LdapResult {
        LdapResult::with_code(ResultCode::Success)
    }

    #[tokio::test]
    async fn complete_is_exactly_once() {
        let table = PendingTable::new();
        let rx = table.register(1, ResponseKind::Add);
        assert_eq!(
            table.complete(1, ResponseBody::Add(ok_result())),
            RouteStatus::Delivered
        );
        // Second completion finds nothing.
        assert_eq!(
            table.complete(1, ResponseBody::Add(ok_result())),
            RouteStatus::NotFound
        );
        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome.kind(), ResponseKind::Add);
    }

    #[tokio::test]
    async fn cancel_racing_complete_yields_one_outcome() {
        for _ in 0..64 {
            let table = Arc::new(PendingTable::new());
            let rx = table.register(7, ResponseKind::Delete);
            let a = {
                let table = Arc::clone(&table);
                tokio::spawn(async move { table.cancel(7).is_some() })
            };
            let b = {
                let table = Arc::clone(&table);
                tokio::spawn(async move {
                    table.complete(7, ResponseBody::Delete(ok_result())) == RouteStatus::Delivered
                })
            };
            let cancelled = a.await.unwrap();
            let completed = b.await.unwrap();
            assert!(
                cancelled ^ completed,
                "exactly one side must win (cancel={cancelled}, complete={completed})"
            );
            let outcome = rx.await.unwrap();
            match (cancelled, outcome) {
                (true, Err(LdapError::Cancelled)) => {}
                (false, Ok(body)) => assert_eq!(body.kind(), ResponseKind::Delete),
                (c, o) => panic!("inconsistent outcome: cancelled={c}, outcome={o:?}"),
            }
        }
    }

    #[tokio::test]
    async fn kind_mismatch_fails_entry() {
        let table = PendingTable::new();
        let rx = table.register(3, ResponseKind::Delete);
        let status = table.complete(3, ResponseBody::Add(ok_result()));
        assert_eq!(
            status,
            RouteStatus::Mismatch {
                expected: ResponseKind::Delete
            }
        );
        match rx.await.unwrap() {
            Err(LdapError::KindMismatch {
                message_id,
                expected,
                got,
            }) => {
                assert_eq!(message_id, 3);
                assert_eq!(expected, "delete");
                assert_eq!(got, "add");
            }
            other => panic!("expected KindMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn search_streams_items_then_done() {
        let table = PendingTable::new();
        let (mut items, done) = table.register_search(9);
        table.push_search_item(
            9,
            SearchItem::Entry(SearchResultEntry {
                object_name: "cn=a".to_string(),
                attributes: vec![],
            }),
        );
        table.push_search_item(
            9,
            SearchItem::Reference(SearchResultReference {
                uris: vec!["ldap://x/".to_string()],
            }),
        );
        table.push_search_item(
            9,
            SearchItem::Entry(SearchResultEntry {
                object_name: "cn=b".to_string(),
                attributes: vec![],
            }),
        );
        assert_eq!(
            table.complete(9, ResponseBody::SearchDone(ok_result())),
            RouteStatus::Delivered
        );
        let outcome = done.await.unwrap().unwrap();
        assert_eq!(outcome.entry_count, 2);
        assert_eq!(outcome.reference_count, 1);
        let mut streamed = 0;
        while items.try_recv().is_ok() {
            streamed += 1;
        }
        assert_eq!(streamed, 3);
    }

    #[tokio::test]
    async fn bind_entry_is_multi_shot() {
        let table = PendingTable::new();
        let mut rx = table.register_bind(2);
        let in_progress = BindResponse {
            result: LdapResult::with_code(ResultCode::SaslBindInProgress),
            server_sasl_creds: Some(b"challenge".to_vec()),
        };
        assert_eq!(
            table.push_bind_response(2, in_progress.clone()),
            RouteStatus::Delivered
        );
        // Entry still present for the follow-up leg on the same id.
        assert!(table.contains(2));
        let success = BindResponse {
            result: ok_result(),
            server_sasl_creds: None,
        };
        assert_eq!(
            table.push_bind_response(2, success.clone()),
            RouteStatus::Delivered
        );
        assert!(table.remove(2));
        assert_eq!(rx.recv().await.unwrap().unwrap(), in_progress);
        assert_eq!(rx.recv().await.unwrap().unwrap(), success);
    }

    #[tokio::test]
    async fn drain_fails_everything_with_same_reason() {
        let table = PendingTable::new();
        let rx1 = table.register(1, ResponseKind::Add);
        let rx2 = table.register(2, ResponseKind::Modify);
        let (_, done) = table.register_search(3);
        let reason = LdapError::Closed("test teardown".to_string());
        let mut drained = table.drain(&reason);
        drained.sort_by_key(|(id, _)| *id);
        assert_eq!(
            drained,
            vec![
                (1, ResponseKind::Add),
                (2, ResponseKind::Modify),
                (3, ResponseKind::Search)
            ]
        );
        assert!(table.is_empty());
        for outcome in [rx1.await.unwrap(), rx2.await.unwrap()] {
            assert!(matches!(outcome, Err(LdapError::Closed(_))));
        }
        assert!(matches!(done.await.unwrap(), Err(LdapError::Closed(_))));
        // Late response after drain is dropped.
        assert_eq!(
            table.complete(1, ResponseBody::Add(ok_result())),
            RouteStatus::NotFound
        );
    }
}
