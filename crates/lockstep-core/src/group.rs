//! Group-communication interface.
//!
//! The replication substrate is a collaborator, not part of the engine: it
//! must deliver FIFO totally-ordered actions tagged with dense
//! `(seqno_global, seqno_local)` pairs and a primary-component flag. The
//! engine talks to it through [`GroupComm`]; real substrates live with the
//! embedder.
//!
//! Contract: an action submitted through [`GroupComm::repl`] is ordered
//! and its seqnos returned to the caller; it is *not* re-delivered through
//! [`GroupComm::recv`] on the same node. `recv` yields everything else in
//! total order.
//!
//! [`LoopbackGroup`] is the in-process single-node backend: a bounded
//! channel is the serializer. It exists for single-node operation and for
//! tests, which use [`LoopbackGroup::inject`] to play the role of a remote
//! node.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use lockstep_error::{LockstepError, Result};
use lockstep_types::Seqno;
use lockstep_wire::{ActionHeader, ActionKind, ComponentMsg};

/// One totally-ordered action handed to the receive loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub kind: ActionKind,
    pub payload: Vec<u8>,
    pub seqno_global: Seqno,
    pub seqno_local: Seqno,
}

/// The group-communication substrate as the engine sees it.
pub trait GroupComm: Send + Sync {
    /// Submit an action for total ordering. Blocks until the group has
    /// ordered it and returns its `(seqno_global, seqno_local)`.
    ///
    /// # Errors
    ///
    /// `BackendClosed` after [`close`](Self::close); `Backend` for
    /// substrate failures.
    fn repl(&self, kind: ActionKind, payload: &[u8]) -> Result<(Seqno, Seqno)>;

    /// Block for the next delivered action.
    ///
    /// # Errors
    ///
    /// `BackendClosed` once the connection is closed and the queue is
    /// drained.
    fn recv(&self) -> Result<Delivery>;

    /// Close the connection. Pending deliveries drain; subsequent
    /// operations fail with `BackendClosed`.
    fn close(&self);
}

/// Seqno assignment state of the loopback backend. Both streams are dense
/// and, with a single node, identical.
#[derive(Debug)]
struct SeqnoState {
    global: Seqno,
    local: Seqno,
}

/// In-process single-node group backend.
pub struct LoopbackGroup {
    seqnos: Mutex<SeqnoState>,
    tx: Mutex<Option<Sender<(Seqno, Vec<u8>)>>>,
    rx: Receiver<(Seqno, Vec<u8>)>,
    name: String,
}

impl LoopbackGroup {
    /// Open a loopback connection for group `name`.
    ///
    /// Delivers an initial primary component message (one member, index 0)
    /// outside the seqno streams, the way a backend announces the
    /// component it joined.
    #[must_use]
    pub fn open(name: &str, queue_depth: usize) -> Arc<Self> {
        let (tx, rx) = bounded(queue_depth.max(1));
        let group = Arc::new(Self {
            seqnos: Mutex::new(SeqnoState {
                global: 0,
                local: 0,
            }),
            tx: Mutex::new(Some(tx)),
            rx,
            name: name.to_owned(),
        });

        let member = format!("{name}-0");
        let comp = ComponentMsg::new(true, 0, vec![member])
            .expect("loopback member id is valid")
            .to_bytes();
        group
            .enqueue(ActionKind::Primary, &comp, 0, 0)
            .expect("fresh loopback queue accepts the component message");
        info!(
            target: "lockstep_core::group",
            group = %group.name,
            "loopback group open, primary component announced"
        );
        group
    }

    /// Order an action *as another node would*: assign seqnos and enqueue
    /// it for the receive loop. This is the test double for remote
    /// traffic.
    ///
    /// # Errors
    ///
    /// `BackendClosed` after `close`.
    pub fn inject(&self, kind: ActionKind, payload: &[u8]) -> Result<(Seqno, Seqno)> {
        let (seqno_global, seqno_local) = self.next_seqnos()?;
        self.enqueue(kind, payload, seqno_global, seqno_local)?;
        debug!(
            target: "lockstep_core::group",
            kind = ?kind,
            seqno_global,
            seqno_local,
            "action injected"
        );
        Ok((seqno_global, seqno_local))
    }

    fn next_seqnos(&self) -> Result<(Seqno, Seqno)> {
        if self.tx.lock().is_none() {
            return Err(LockstepError::BackendClosed);
        }
        let mut seqnos = self.seqnos.lock();
        seqnos.global += 1;
        seqnos.local += 1;
        Ok((seqnos.global, seqnos.local))
    }

    fn enqueue(
        &self,
        kind: ActionKind,
        payload: &[u8],
        seqno_global: Seqno,
        seqno_local: Seqno,
    ) -> Result<()> {
        let size = u32::try_from(payload.len())
            .map_err(|_| LockstepError::codec("action payload exceeds u32"))?;
        let header = ActionHeader::whole(kind, size, seqno_global);
        let mut wire = Vec::with_capacity(lockstep_wire::ACTION_HEADER_SIZE + payload.len());
        wire.extend_from_slice(&header.to_bytes());
        wire.extend_from_slice(payload);

        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(LockstepError::BackendClosed);
        };
        tx.send((seqno_local, wire))
            .map_err(|_| LockstepError::BackendClosed)
    }
}

impl GroupComm for LoopbackGroup {
    fn repl(&self, kind: ActionKind, payload: &[u8]) -> Result<(Seqno, Seqno)> {
        // With one node the channel is the total order; the action is
        // ordered the moment its seqnos are assigned, and is not
        // re-delivered to the caller's own receive loop.
        let _ = payload;
        let seqnos = self.next_seqnos()?;
        debug!(
            target: "lockstep_core::group",
            kind = ?kind,
            seqno_global = seqnos.0,
            seqno_local = seqnos.1,
            "action replicated"
        );
        Ok(seqnos)
    }

    fn recv(&self) -> Result<Delivery> {
        let (seqno_local, wire) = self
            .rx
            .recv()
            .map_err(|_| LockstepError::BackendClosed)?;
        let header = ActionHeader::from_bytes(&wire)?;
        Ok(Delivery {
            kind: header.kind,
            payload: wire[lockstep_wire::ACTION_HEADER_SIZE..].to_vec(),
            seqno_global: header.act_id,
            seqno_local,
        })
    }

    fn close(&self) {
        info!(target: "lockstep_core::group", group = %self.name, "loopback group closed");
        self.tx.lock().take();
    }
}

impl std::fmt::Debug for LoopbackGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let seqnos = self.seqnos.lock();
        f.debug_struct("LoopbackGroup")
            .field("name", &self.name)
            .field("seqno_global", &seqnos.global)
            .field("seqno_local", &seqnos.local)
            .finish()
    }
}
