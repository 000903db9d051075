//! In-process store implementation. Backs tests and single-binary
//! deployments; the REST facade consumes the control-plane half
//! (`resolve`, `pending_ids`, `set_mode`, ...) from the same handle.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;

use super::{Awaited, Error, ItemState, ResponseVerdict, Store, Verdict};
use crate::http::{Request, Response};
use crate::policy::{Blocklist, PolicyMode};

struct Item {
	request: Request,
	response: Option<Response>,
	state: ItemState,
	verdict_tx: watch::Sender<Option<Verdict>>,
	response_verdict_tx: watch::Sender<Option<ResponseVerdict>>,
}

#[derive(Default)]
struct PolicyState {
	mode: PolicyMode,
	lists: Blocklist,
}

/// Serializable view of one record, as the REST facade exposes it.
#[derive(Clone, Debug, Serialize)]
pub struct ItemSnapshot {
	pub id: u64,
	pub state: ItemState,
	pub request: Request,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub response: Option<Response>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub edited: Option<Verdict>,
}

#[derive(Default)]
pub struct MemoryStore {
	items: RwLock<HashMap<u64, Item>>,
	// Append-only, in request-id order.
	pending: RwLock<Vec<u64>>,
	policy: RwLock<PolicyState>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	// --- control-plane half -------------------------------------------------

	/// Records a reviewer verdict and wakes the waiting handler.
	pub fn resolve(&self, id: u64, verdict: Verdict) -> Result<(), Error> {
		let mut items = self.items.write().expect("store lock poisoned");
		let item = items.get_mut(&id).ok_or(Error::UnknownItem(id))?;
		item.state = match verdict {
			Verdict::Allow => ItemState::Allowed,
			Verdict::AllowEdited { .. } => ItemState::EditedAllowed,
			Verdict::Block => ItemState::Blocked,
		};
		let _ = item.verdict_tx.send(Some(verdict));
		drop(items);
		self.drop_pending(id);
		Ok(())
	}

	pub fn resolve_response(&self, id: u64, verdict: ResponseVerdict) -> Result<(), Error> {
		let items = self.items.read().expect("store lock poisoned");
		let item = items.get(&id).ok_or(Error::UnknownItem(id))?;
		let _ = item.response_verdict_tx.send(Some(verdict));
		Ok(())
	}

	pub fn set_mode(&self, mode: PolicyMode) {
		self.policy.write().expect("store lock poisoned").mode = mode;
	}

	pub fn set_blocklists(&self, lists: Blocklist) {
		self.policy.write().expect("store lock poisoned").lists = lists;
	}

	/// Ids still awaiting a verdict, in request-id order.
	pub fn pending_ids(&self) -> Vec<u64> {
		self.pending.read().expect("store lock poisoned").clone()
	}

	pub fn item(&self, id: u64) -> Option<ItemSnapshot> {
		let items = self.items.read().expect("store lock poisoned");
		items.get(&id).map(|item| ItemSnapshot {
			id,
			state: item.state,
			request: item.request.clone(),
			response: item.response.clone(),
			edited: match item.verdict_tx.borrow().as_ref() {
				Some(v @ Verdict::AllowEdited { .. }) => Some(v.clone()),
				_ => None,
			},
		})
	}

	// ------------------------------------------------------------------------

	fn drop_pending(&self, id: u64) {
		self
			.pending
			.write()
			.expect("store lock poisoned")
			.retain(|&p| p != id);
	}

	fn mark(&self, id: u64, state: ItemState) {
		if let Some(item) = self
			.items
			.write()
			.expect("store lock poisoned")
			.get_mut(&id)
		{
			item.state = state;
		}
		self.drop_pending(id);
	}

	async fn wait<V: Clone>(
		mut rx: watch::Receiver<Option<V>>,
		timeout: Duration,
	) -> Option<Awaited<V>> {
		// A verdict recorded between publish and this wait must be observed.
		if let Some(v) = rx.borrow().clone() {
			return Some(Awaited::Decided(v));
		}
		if timeout.is_zero() {
			return None;
		}
		let decided = async {
			loop {
				if rx.changed().await.is_err() {
					return Awaited::Cancelled;
				}
				if let Some(v) = rx.borrow().clone() {
					return Awaited::Decided(v);
				}
			}
		};
		tokio::time::timeout(timeout, decided).await.ok()
	}
}

#[async_trait]
impl Store for MemoryStore {
	async fn publish_pending(&self, req: &Request) -> Result<u64, Error> {
		let id = req.id;
		let (verdict_tx, _) = watch::channel(None);
		let (response_verdict_tx, _) = watch::channel(None);
		self.items.write().expect("store lock poisoned").insert(
			id,
			Item {
				request: req.clone(),
				response: None,
				state: ItemState::Pending,
				verdict_tx,
				response_verdict_tx,
			},
		);
		self.pending.write().expect("store lock poisoned").push(id);
		Ok(id)
	}

	async fn await_verdict(&self, id: u64, timeout: Duration) -> Result<Awaited<Verdict>, Error> {
		let rx = {
			let items = self.items.read().expect("store lock poisoned");
			items
				.get(&id)
				.ok_or(Error::UnknownItem(id))?
				.verdict_tx
				.subscribe()
		};
		match Self::wait(rx, timeout).await {
			Some(outcome) => Ok(outcome),
			None => {
				self.mark(id, ItemState::TimedOut);
				Ok(Awaited::TimedOut)
			},
		}
	}

	async fn cancel(&self, id: u64) -> Result<(), Error> {
		self.mark(id, ItemState::Cancelled);
		Ok(())
	}

	async fn publish_response(&self, id: u64, resp: &Response) -> Result<(), Error> {
		let mut items = self.items.write().expect("store lock poisoned");
		let item = items.get_mut(&id).ok_or(Error::UnknownItem(id))?;
		item.response = Some(resp.clone());
		Ok(())
	}

	async fn await_response_verdict(
		&self,
		id: u64,
		timeout: Duration,
	) -> Result<Awaited<ResponseVerdict>, Error> {
		let rx = {
			let items = self.items.read().expect("store lock poisoned");
			items
				.get(&id)
				.ok_or(Error::UnknownItem(id))?
				.response_verdict_tx
				.subscribe()
		};
		Ok(Self::wait(rx, timeout).await.unwrap_or(Awaited::TimedOut))
	}

	async fn read_policy_mode(&self) -> Result<PolicyMode, Error> {
		Ok(self.policy.read().expect("store lock poisoned").mode)
	}

	async fn read_blocklists(&self) -> Result<Blocklist, Error> {
		Ok(self.policy.read().expect("store lock poisoned").lists.clone())
	}
}

#[cfg(test)]
mod tests {
	use bytes::Bytes;
	use chrono::Utc;

	use super::*;
	use crate::http::{HeaderMap, Scheme, Version, next_request_id};

	fn request() -> Request {
		Request {
			id: next_request_id(),
			method: "GET".into(),
			scheme: Scheme::Http,
			host: "example.test".into(),
			port: 80,
			path: "/".into(),
			version: Version::Http11,
			headers: HeaderMap::new(),
			body: Bytes::new(),
			received_at: Utc::now(),
			client_addr: None,
		}
	}

	#[tokio::test]
	async fn verdict_posted_after_publish_is_observed() {
		let store = std::sync::Arc::new(MemoryStore::new());
		let id = store.publish_pending(&request()).await.unwrap();
		assert_eq!(store.pending_ids(), vec![id]);

		let waiter = {
			let store = store.clone();
			tokio::spawn(async move { store.await_verdict(id, Duration::from_secs(5)).await })
		};
		tokio::task::yield_now().await;
		store.resolve(id, Verdict::Allow).unwrap();
		let outcome = waiter.await.unwrap().unwrap();
		assert!(matches!(outcome, Awaited::Decided(Verdict::Allow)));
		assert!(store.pending_ids().is_empty());
		assert_eq!(store.item(id).unwrap().state, ItemState::Allowed);
	}

	#[tokio::test]
	async fn verdict_posted_before_wait_is_observed() {
		let store = MemoryStore::new();
		let id = store.publish_pending(&request()).await.unwrap();
		store.resolve(id, Verdict::Block).unwrap();
		let outcome = store.await_verdict(id, Duration::ZERO).await.unwrap();
		assert!(matches!(outcome, Awaited::Decided(Verdict::Block)));
	}

	#[tokio::test]
	async fn zero_timeout_returns_immediately() {
		let store = MemoryStore::new();
		let id = store.publish_pending(&request()).await.unwrap();
		let outcome = store.await_verdict(id, Duration::ZERO).await.unwrap();
		assert!(matches!(outcome, Awaited::TimedOut));
		assert_eq!(store.item(id).unwrap().state, ItemState::TimedOut);
	}

	#[tokio::test]
	async fn cancelled_items_leave_the_pending_list() {
		let store = MemoryStore::new();
		let id = store.publish_pending(&request()).await.unwrap();
		store.cancel(id).await.unwrap();
		assert!(store.pending_ids().is_empty());
		assert_eq!(store.item(id).unwrap().state, ItemState::Cancelled);
	}

	#[tokio::test]
	async fn pending_ids_stay_in_request_id_order() {
		let store = MemoryStore::new();
		let a = store.publish_pending(&request()).await.unwrap();
		let b = store.publish_pending(&request()).await.unwrap();
		let c = store.publish_pending(&request()).await.unwrap();
		assert_eq!(store.pending_ids(), vec![a, b, c]);
		store.resolve(b, Verdict::Allow).unwrap();
		assert_eq!(store.pending_ids(), vec![a, c]);
	}

	#[tokio::test]
	async fn blocklist_reads_are_snapshots() {
		let store = MemoryStore::new();
		store.set_blocklists(Blocklist {
			domains: vec!["a.test".into()],
			keywords: vec![],
		});
		let first = store.read_blocklists().await.unwrap();
		store.set_blocklists(Blocklist {
			domains: vec!["b.test".into()],
			keywords: vec![],
		});
		// The earlier snapshot is unaffected; a new read sees the update.
		assert_eq!(first.domains, vec!["a.test".to_string()]);
		let second = store.read_blocklists().await.unwrap();
		assert_eq!(second.domains, vec!["b.test".to_string()]);
	}

	#[tokio::test]
	async fn edited_verdict_carries_the_replacement_request() {
		let store = MemoryStore::new();
		let mut req = request();
		req.body = Bytes::from_static(b"{\"u\":\"a\",\"p\":\"b\"}");
		let id = store.publish_pending(&req).await.unwrap();
		let mut edited = req.clone();
		edited.body = Bytes::from_static(b"{\"u\":\"a\",\"p\":\"c\"}");
		store
			.resolve(
				id,
				Verdict::AllowEdited {
					request: Box::new(edited),
				},
			)
			.unwrap();
		match store.await_verdict(id, Duration::ZERO).await.unwrap() {
			Awaited::Decided(Verdict::AllowEdited { request }) => {
				assert_eq!(request.body.as_ref(), b"{\"u\":\"a\",\"p\":\"c\"}");
			},
			other => panic!("unexpected outcome: {other:?}"),
		}
		assert_eq!(store.item(id).unwrap().state, ItemState::EditedAllowed);
	}
}
