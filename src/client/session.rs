//! Logical sessions and the transaction state machine (NONE → STARTED → COMMITTED|ABORTED).

use bson::{doc, Bson, Document};

use crate::error::{Error, Result};

/// A server-tracked logical session, identified by the `id` document `startSession`
/// returned (a BSON document wrapping a UUID, per the server's `lsid` convention).
#[derive(Debug, Clone)]
pub struct Session {
    pub(crate) id: Document,
}

impl Session {
    pub(crate) fn new(id: Document) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &Document {
        &self.id
    }

    /// Begin a new transaction scoped to this session. The returned handle starts in
    /// `STARTED` state; callers drive it to a terminal state via `commit`/`abort`, or let
    /// `finish` decide based on whether the enclosed work failed.
    pub fn start_transaction(&self) -> Transaction {
        let mut txn = Transaction::new(self.id.clone());
        txn.start();
        txn
    }
}

/// The transaction's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    None,
    Started,
    Committed,
    Aborted,
}

/// One multi-statement transaction. Entirely owned by the scope that started it: there is
/// no way to hand a `Transaction` to another scope and have two owners agree on its state.
#[derive(Debug, Clone)]
pub struct Transaction {
    session_id: Document,
    txn_number: i64,
    state: TransactionState,
    action_count: u32,
    error: Option<Error>,
}

impl Transaction {
    fn new(session_id: Document) -> Self {
        Self {
            session_id,
            txn_number: 0,
            state: TransactionState::None,
            action_count: 0,
            error: None,
        }
    }

    fn start(&mut self) {
        // A wall-clock-derived value is sufficient as long as it never decreases within a
        // session; real clock resolution means two transactions started back-to-back can
        // collide, so nanosecond resolution is used rather than whole seconds.
        self.txn_number = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        self.state = TransactionState::Started;
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Started
    }

    pub fn is_ended(&self) -> bool {
        matches!(self.state, TransactionState::Committed | TransactionState::Aborted)
    }

    /// The error captured when a command failed while this transaction was active, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Stamp `cmd` with this transaction's metadata: `lsid`, `txnNumber`, `autocommit:
    /// false`, and — only on the very first command — `startTransaction: true`.
    pub(crate) fn apply_to(&self, cmd: &mut Document) {
        if self.action_count == 0 {
            cmd.insert("startTransaction", true);
        }
        cmd.insert("txnNumber", Bson::Int64(self.txn_number));
        cmd.insert("autocommit", false);
        cmd.insert("lsid", self.session_id.clone());
    }

    pub(crate) fn record_success(&mut self) {
        self.action_count += 1;
    }

    /// Record a failed command: transition to ABORTED and capture the error, but only if
    /// the transaction hasn't already reached a terminal state.
    pub(crate) fn record_failure(&mut self, error: Error) {
        if !self.is_ended() {
            self.state = TransactionState::Aborted;
            self.error = Some(error);
        }
    }

    fn commit_command(&self) -> Document {
        doc! {
            "commitTransaction": 1,
            "lsid": self.session_id.clone(),
            "txnNumber": self.txn_number,
            "autocommit": false,
        }
    }

    fn abort_command(&self) -> Document {
        doc! {
            "abortTransaction": 1,
            "lsid": self.session_id.clone(),
            "txnNumber": self.txn_number,
            "autocommit": false,
        }
    }

    /// Finish this transaction given whether the enclosed scope failed. If no command
    /// succeeded (`action_count == 0`), no RPC is issued either way — per the invariant
    /// that a transaction with zero actions must never send commit/abort.
    ///
    /// `send` is handed the command to issue (commit or abort) and is expected to perform
    /// the actual dispatch; this keeps the state machine itself free of a hard dependency
    /// on the connection type.
    pub async fn finish<F, Fut>(mut self, failed: bool, send: F) -> Transaction
    where
        F: FnOnce(Document) -> Fut,
        Fut: std::future::Future<Output = Result<Document>>,
    {
        if self.is_ended() {
            return self;
        }
        if !self.is_active() {
            self.state = TransactionState::Aborted;
            return self;
        }

        if self.action_count == 0 {
            // Per the state machine: a scope exit with zero actions always lands on
            // ABORTED and never issues an RPC, regardless of whether the scope itself
            // failed — there is nothing on the server to commit.
            self.state = TransactionState::Aborted;
            return self;
        }

        let (command, target_state) = if failed {
            (self.abort_command(), TransactionState::Aborted)
        } else {
            (self.commit_command(), TransactionState::Committed)
        };

        match send(command).await {
            Ok(_) => self.state = target_state,
            Err(e) => {
                self.state = TransactionState::Aborted;
                self.error = Some(e);
            }
        }
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fresh_session() -> Session {
        Session::new(doc! { "id": bson::Uuid::new() })
    }

    #[test]
    fn start_transitions_to_started() {
        let session = fresh_session();
        let txn = session.start_transaction();
        assert_eq!(txn.state(), TransactionState::Started);
        assert!(txn.is_active());
    }

    #[test]
    fn apply_to_sets_start_transaction_only_on_first_command() {
        let session = fresh_session();
        let mut txn = session.start_transaction();
        let mut first = Document::new();
        txn.apply_to(&mut first);
        assert_eq!(first.get_bool("startTransaction").unwrap(), true);

        txn.record_success();
        let mut second = Document::new();
        txn.apply_to(&mut second);
        assert!(!second.contains_key("startTransaction"));
        assert_eq!(second.get_bool("autocommit").unwrap(), false);
    }

    #[tokio::test]
    async fn zero_action_scope_exit_sends_no_rpc() {
        let session = fresh_session();
        let txn = session.start_transaction();
        let mut rpc_sent = false;
        let finished = txn
            .finish(false, |_cmd| async {
                rpc_sent = true;
                Ok(Document::new())
            })
            .await;
        assert!(!rpc_sent);
        assert_eq!(finished.state(), TransactionState::Aborted);
    }

    #[tokio::test]
    async fn failure_after_actions_aborts_and_captures_error() {
        let session = fresh_session();
        let mut txn = session.start_transaction();
        txn.record_success();
        let finished = txn
            .finish(true, |_cmd| async {
                Ok(doc! { "ok": 1.0 })
            })
            .await;
        assert_eq!(finished.state(), TransactionState::Aborted);
    }

    #[tokio::test]
    async fn commit_after_actions_sends_commit_command() {
        let session = fresh_session();
        let mut txn = session.start_transaction();
        txn.record_success();
        let mut sent_command = None;
        let finished = txn
            .finish(false, |cmd| {
                sent_command = Some(cmd.clone());
                async move { Ok(doc! { "ok": 1.0 }) }
            })
            .await;
        assert_eq!(finished.state(), TransactionState::Committed);
        assert!(sent_command.unwrap().contains_key("commitTransaction"));
    }
}
