//! The shared store facade: the only boundary between the data plane and
//! the external review control plane.
//!
//! Any backing store with string-keyed records, atomic updates, and a
//! pub/sub or polling channel can implement [`Store`]. The in-process
//! implementation lives in [`memory`].

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::http::{Request, Response};
use crate::policy::{Blocklist, PolicyMode};

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("store unavailable: {0}")]
	Unavailable(String),
	#[error("unknown intercept item {0}")]
	UnknownItem(u64),
}

/// Reviewer decision for a pending request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "kebab-case")]
pub enum Verdict {
	Allow,
	AllowEdited { request: Box<Request> },
	Block,
}

/// Reviewer decision for a buffered response, symmetric with [`Verdict`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "kebab-case")]
pub enum ResponseVerdict {
	Allow,
	AllowEdited { response: Box<Response> },
	Block,
}

/// What a wait for a verdict produced.
#[derive(Clone, Debug)]
pub enum Awaited<V> {
	Decided(V),
	TimedOut,
	Cancelled,
}

/// Lifecycle of an intercept item. `Pending` means exactly one connection
/// handler is blocked awaiting the verdict.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemState {
	Pending,
	Allowed,
	EditedAllowed,
	Blocked,
	Cancelled,
	TimedOut,
}

#[async_trait]
pub trait Store: Send + Sync {
	/// Records a request as pending review. Returns its id.
	async fn publish_pending(&self, req: &Request) -> Result<u64, Error>;

	/// Blocks until a verdict for `id` arrives, the timeout elapses, or the
	/// item is cancelled. Observes any verdict recorded after
	/// `publish_pending` returned.
	async fn await_verdict(&self, id: u64, timeout: Duration) -> Result<Awaited<Verdict>, Error>;

	/// Marks the item cancelled (client went away); the UI drops it.
	async fn cancel(&self, id: u64) -> Result<(), Error>;

	/// Attaches the origin response to the item's record.
	async fn publish_response(&self, id: u64, resp: &Response) -> Result<(), Error>;

	/// Symmetric wait for a response verdict; only used when response review
	/// is enabled.
	async fn await_response_verdict(
		&self,
		id: u64,
		timeout: Duration,
	) -> Result<Awaited<ResponseVerdict>, Error>;

	async fn read_policy_mode(&self) -> Result<PolicyMode, Error>;

	/// A blocklist snapshot, consistent within this call. Successive calls
	/// may observe different snapshots.
	async fn read_blocklists(&self) -> Result<Blocklist, Error>;
}
