//! Open notification substreams and the task that drives them.
//!
//! After the handshake the raw substream is moved into a driver task that joins
//! a read loop and a write loop over the two halves of a length-prefixed
//! [`Framed`]. Reads and writes make progress independently, so a peer that
//! stops reading stalls only our writes and never our reads.
//!
//! Applications talk to the driver through a [`SubstreamHandle`], or its two
//! halves [`NotificationSender`] and [`NotificationReceiver`]:
//!
//! - outbound notifications take one unit of [`Credit`] each and go to the
//!   writer through an unbounded queue (credit is the bound);
//! - inbound notifications go to the consumer through a bounded channel; when
//!   it is full the reader stops pulling from the transport.

use std::{
    fmt, io,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use asynchronous_codec::Framed;
use bytes::Bytes;
use futures::{AsyncRead, AsyncWrite, Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};
use vertex_net_codec::{FrameError, LengthPrefixedCodec};
use vertex_net_transport::{Direction, PeerId, ProtocolName};

use crate::{
    NotificationError, NotificationMetrics,
    credit::{Credit, CreditPermit, CreditUnavailable},
    manager::ManagerInner,
};

/// Identifies one substream within a manager. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubstreamId(pub(crate) u64);

impl fmt::Display for SubstreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a substream.
///
/// States only move forward: `Connecting → Handshaking → Open → Closing →
/// Closed`, with `Failed` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubstreamState {
    Connecting,
    Handshaking,
    Open,
    Closing,
    Closed,
    Failed,
}

impl SubstreamState {
    fn rank(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Handshaking => 1,
            Self::Open => 2,
            Self::Closing => 3,
            Self::Closed | Self::Failed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Closing, closed or failed.
    pub fn is_closing(self) -> bool {
        self.rank() >= Self::Closing.rank()
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Where a substream lives in the manager's table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubstreamKey {
    pub peer: PeerId,
    pub protocol: ProtocolName,
    pub direction: Direction,
}

/// Point-in-time view of a substream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstreamInfo {
    pub id: SubstreamId,
    pub peer: PeerId,
    pub protocol: ProtocolName,
    pub direction: Direction,
    pub state: SubstreamState,
}

pub(crate) struct Outbound {
    payload: Bytes,
    permit: CreditPermit,
}

/// State shared between the handles, the driver and the manager.
pub(crate) struct SubstreamShared {
    id: SubstreamId,
    key: SubstreamKey,
    state: watch::Sender<SubstreamState>,
    released: watch::Sender<bool>,
    /// Set once the manager no longer lists the substream.
    retired: watch::Sender<bool>,
    reached_open: AtomicBool,
    failure: Mutex<Option<NotificationError>>,
    credit: Credit,
    max_notification_size: usize,
    outbound: mpsc::UnboundedSender<Outbound>,
    metrics: NotificationMetrics,
    manager: Weak<ManagerInner>,
}

impl SubstreamShared {
    pub(crate) fn new(
        id: SubstreamId,
        key: SubstreamKey,
        credit_window: usize,
        max_notification_size: usize,
        metrics: NotificationMetrics,
        manager: Weak<ManagerInner>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            id,
            key,
            state: watch::Sender::new(SubstreamState::Connecting),
            released: watch::Sender::new(false),
            retired: watch::Sender::new(false),
            reached_open: AtomicBool::new(false),
            failure: Mutex::new(None),
            credit: Credit::new(credit_window),
            max_notification_size,
            outbound,
            metrics,
            manager,
        });
        (shared, outbound_rx)
    }

    pub(crate) fn id(&self) -> SubstreamId {
        self.id
    }

    pub(crate) fn key(&self) -> &SubstreamKey {
        &self.key
    }

    pub(crate) fn state(&self) -> SubstreamState {
        *self.state.borrow()
    }

    pub(crate) fn metrics(&self) -> &NotificationMetrics {
        &self.metrics
    }

    pub(crate) fn info(&self) -> SubstreamInfo {
        SubstreamInfo {
            id: self.id,
            peer: self.key.peer,
            protocol: self.key.protocol.clone(),
            direction: self.key.direction,
            state: self.state(),
        }
    }

    pub(crate) fn failure(&self) -> Option<NotificationError> {
        self.failure.lock().clone()
    }

    /// Error to report once the substream can no longer carry notifications.
    pub(crate) fn terminal_error(&self) -> NotificationError {
        self.failure().unwrap_or(NotificationError::Closed)
    }

    /// Moves to `next` if that is a forward transition. Returns whether it moved.
    pub(crate) fn transition(&self, next: SubstreamState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            trace!(target: "notifications::substream", id = %self.id, peer = %self.key.peer, protocol = %self.key.protocol, state = ?next, "State transition");
            if next == SubstreamState::Open {
                self.reached_open.store(true, Ordering::Release);
            }
        }
        moved
    }

    /// Records `error` and fails the substream. The first failure wins.
    pub(crate) fn fail(&self, error: NotificationError) {
        {
            let mut failure = self.failure.lock();
            if self.state().is_terminal() {
                return;
            }
            failure.get_or_insert(error.clone());
        }
        if self.transition(SubstreamState::Failed) {
            debug!(target: "notifications::substream", id = %self.id, peer = %self.key.peer, protocol = %self.key.protocol, %error, "Substream failed");
        }
        self.credit.close();
    }

    /// Starts a graceful close. No-op once closing.
    pub(crate) fn request_close(&self) {
        if self.transition(SubstreamState::Closing) {
            debug!(target: "notifications::substream", id = %self.id, peer = %self.key.peer, protocol = %self.key.protocol, "Closing substream");
            self.credit.close();
        }
    }

    async fn wait_for_state(&self, predicate: impl FnMut(&SubstreamState) -> bool) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(predicate).await;
    }

    pub(crate) async fn closing(&self) {
        self.wait_for_state(|state| state.is_closing()).await;
    }

    async fn failed(&self) {
        self.wait_for_state(|state| *state == SubstreamState::Failed)
            .await;
    }

    pub(crate) fn is_released(&self) -> bool {
        *self.released.borrow()
    }

    /// Waits until the transport substream has been dropped.
    pub(crate) async fn wait_released(&self) {
        let mut released = self.released.subscribe();
        let _ = released.wait_for(|released| *released).await;
    }

    /// Settles the terminal state and marks the transport substream as dropped.
    pub(crate) fn finish(&self) {
        self.transition(SubstreamState::Closed);
        self.credit.close();
        if self.released.send_replace(true) {
            return;
        }

        if self.reached_open.load(Ordering::Acquire) {
            match self.state() {
                SubstreamState::Failed => self.metrics.substream_failed(),
                _ => self.metrics.substream_closed(),
            }
        }
    }

    /// Finishes the substream and removes it from the manager.
    pub(crate) async fn release(&self) {
        self.finish();
        if let Some(manager) = self.manager.upgrade() {
            manager.release(self).await;
        }
        self.retired.send_replace(true);
    }

    /// Waits until [`release`](Self::release) has completed.
    pub(crate) async fn wait_retired(&self) {
        let mut retired = self.retired.subscribe();
        let _ = retired.wait_for(|retired| *retired).await;
    }
}

/// Requests a close when the last user handle is dropped.
struct CloseGuard {
    shared: Arc<SubstreamShared>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if !self.shared.state().is_closing() {
            trace!(target: "notifications::substream", id = %self.shared.id, "All handles dropped");
            self.shared.request_close();
        }
    }
}

/// Sending half of a substream. Cheap to clone.
#[derive(Clone)]
pub struct NotificationSender {
    guard: Arc<CloseGuard>,
}

impl fmt::Debug for NotificationSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationSender")
            .field("id", &self.guard.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl NotificationSender {
    fn shared(&self) -> &SubstreamShared {
        &self.guard.shared
    }

    /// Sends one notification, waiting for credit as long as it takes.
    ///
    /// Returns once the notification is queued for the writer. Notifications
    /// are written in the order their `send` calls obtained credit.
    pub async fn send(&self, notification: impl Into<Bytes>) -> Result<(), NotificationError> {
        let notification = notification.into();
        self.check(&notification)?;

        let permit = self
            .shared()
            .credit
            .acquire()
            .await
            .ok_or_else(|| self.shared().terminal_error())?;
        self.enqueue(notification, permit)
    }

    /// Like [`send`](Self::send), but gives up after `timeout`.
    ///
    /// A timeout returns [`NotificationError::BackpressureTimeout`] and leaves the
    /// substream untouched.
    pub async fn send_timeout(
        &self,
        notification: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<(), NotificationError> {
        let notification = notification.into();
        self.check(&notification)?;

        match tokio::time::timeout(timeout, self.shared().credit.acquire()).await {
            Ok(Some(permit)) => self.enqueue(notification, permit),
            Ok(None) => Err(self.shared().terminal_error()),
            Err(_) => {
                self.shared().metrics.backpressure_timeout();
                trace!(target: "notifications::substream", id = %self.shared().id, ?timeout, "Send timed out waiting for credit");
                Err(NotificationError::BackpressureTimeout)
            }
        }
    }

    /// Sends without waiting; fails with [`NotificationError::NoCredit`] if the
    /// window is full.
    pub fn try_send(&self, notification: impl Into<Bytes>) -> Result<(), NotificationError> {
        let notification = notification.into();
        self.check(&notification)?;

        match self.shared().credit.try_acquire() {
            Ok(permit) => self.enqueue(notification, permit),
            Err(CreditUnavailable::Exhausted) => Err(NotificationError::NoCredit),
            Err(CreditUnavailable::Closed) => Err(self.shared().terminal_error()),
        }
    }

    /// Closes the substream and waits until the transport substream is released.
    ///
    /// Notifications already accepted by `send` are flushed first, bounded by the
    /// protocol's close timeout. Calling this more than once is harmless.
    pub async fn close(&self) {
        self.shared().request_close();
        self.shared().wait_released().await;
    }

    pub fn id(&self) -> SubstreamId {
        self.shared().id
    }

    pub fn peer(&self) -> PeerId {
        self.shared().key.peer
    }

    pub fn protocol(&self) -> &ProtocolName {
        &self.shared().key.protocol
    }

    pub fn direction(&self) -> Direction {
        self.shared().key.direction
    }

    pub fn state(&self) -> SubstreamState {
        self.shared().state()
    }

    pub fn credit_available(&self) -> usize {
        self.shared().credit.available()
    }

    pub fn in_flight(&self) -> usize {
        self.shared().credit.in_flight()
    }

    fn check(&self, notification: &Bytes) -> Result<(), NotificationError> {
        let shared = self.shared();
        if shared.state() != SubstreamState::Open {
            return Err(shared.terminal_error());
        }
        if notification.len() > shared.max_notification_size {
            let error = NotificationError::OversizedNotification {
                size: notification.len(),
                max: shared.max_notification_size,
            };
            shared.fail(error.clone());
            return Err(error);
        }
        Ok(())
    }

    fn enqueue(&self, payload: Bytes, permit: CreditPermit) -> Result<(), NotificationError> {
        let shared = self.shared();
        if shared.state() != SubstreamState::Open {
            return Err(shared.terminal_error());
        }
        shared
            .outbound
            .send(Outbound { payload, permit })
            .map_err(|_| shared.terminal_error())
    }
}

/// Receiving half of a substream.
pub struct NotificationReceiver {
    guard: Arc<CloseGuard>,
    inbound: mpsc::Receiver<Bytes>,
}

impl fmt::Debug for NotificationReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationReceiver")
            .field("id", &self.guard.shared.id)
            .finish()
    }
}

impl NotificationReceiver {
    /// Waits for the next notification.
    ///
    /// After the substream ends, buffered notifications are still returned; then
    /// the error that ended it ([`NotificationError::Closed`] for a graceful close).
    pub async fn receive(&mut self) -> Result<Bytes, NotificationError> {
        match self.inbound.recv().await {
            Some(notification) => Ok(notification),
            None => Err(self.guard.shared.terminal_error()),
        }
    }

    /// Notifications as a stream that ends when the substream does.
    pub fn notifications(&mut self) -> impl Stream<Item = Bytes> + '_ {
        futures::stream::poll_fn(move |cx| self.inbound.poll_recv(cx))
    }

    pub fn id(&self) -> SubstreamId {
        self.guard.shared.id
    }

    pub fn state(&self) -> SubstreamState {
        self.guard.shared.state()
    }
}

impl Stream for NotificationReceiver {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbound.poll_recv(cx)
    }
}

/// An open substream.
#[derive(Debug)]
pub struct SubstreamHandle {
    sender: NotificationSender,
    receiver: NotificationReceiver,
    negotiated: ProtocolName,
    remote_handshake: Bytes,
}

impl SubstreamHandle {
    pub async fn send(&self, notification: impl Into<Bytes>) -> Result<(), NotificationError> {
        self.sender.send(notification).await
    }

    pub async fn send_timeout(
        &self,
        notification: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<(), NotificationError> {
        self.sender.send_timeout(notification, timeout).await
    }

    pub fn try_send(&self, notification: impl Into<Bytes>) -> Result<(), NotificationError> {
        self.sender.try_send(notification)
    }

    pub async fn receive(&mut self) -> Result<Bytes, NotificationError> {
        self.receiver.receive().await
    }

    pub fn notifications(&mut self) -> impl Stream<Item = Bytes> + '_ {
        self.receiver.notifications()
    }

    pub async fn close(&self) {
        self.sender.close().await
    }

    pub fn sender(&self) -> &NotificationSender {
        &self.sender
    }

    /// Splits into independently owned halves. Dropping both closes the substream.
    pub fn split(self) -> (NotificationSender, NotificationReceiver) {
        (self.sender, self.receiver)
    }

    pub fn id(&self) -> SubstreamId {
        self.sender.id()
    }

    pub fn peer(&self) -> PeerId {
        self.sender.peer()
    }

    /// Registered protocol this substream belongs to.
    pub fn protocol(&self) -> &ProtocolName {
        self.sender.protocol()
    }

    /// Name actually agreed with the transport; may be a fallback name.
    pub fn negotiated_protocol(&self) -> &ProtocolName {
        &self.negotiated
    }

    pub fn direction(&self) -> Direction {
        self.sender.direction()
    }

    pub fn state(&self) -> SubstreamState {
        self.sender.state()
    }

    pub fn remote_handshake(&self) -> &Bytes {
        &self.remote_handshake
    }

    pub fn credit_available(&self) -> usize {
        self.sender.credit_available()
    }

    pub fn in_flight(&self) -> usize {
        self.sender.in_flight()
    }
}

/// Moves an open substream into its driver task and returns the user handle.
pub(crate) fn spawn_substream<S>(
    shared: Arc<SubstreamShared>,
    io: S,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound_buffer: usize,
    close_timeout: Duration,
    negotiated: ProtocolName,
    remote_handshake: Bytes,
) -> SubstreamHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (inbound_tx, inbound_rx) = mpsc::channel(inbound_buffer.max(1));

    let driver_shared = Arc::clone(&shared);
    tokio::spawn(async move {
        let release = ReleaseOnDrop(Some(Arc::clone(&driver_shared)));
        drive(&driver_shared, io, outbound, inbound_tx, close_timeout).await;
        release.release().await;
    });

    let guard = Arc::new(CloseGuard { shared });
    SubstreamHandle {
        sender: NotificationSender {
            guard: Arc::clone(&guard),
        },
        receiver: NotificationReceiver {
            guard,
            inbound: inbound_rx,
        },
        negotiated,
        remote_handshake,
    }
}

/// Releases the substream even if the driver panics or is aborted.
struct ReleaseOnDrop(Option<Arc<SubstreamShared>>);

impl ReleaseOnDrop {
    async fn release(mut self) {
        if let Some(shared) = self.0.take() {
            shared.release().await;
        }
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        let Some(shared) = self.0.take() else {
            return;
        };
        shared.fail(NotificationError::Io(Arc::new(io::Error::other(
            "substream driver stopped",
        ))));
        shared.finish();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { shared.release().await });
        }
    }
}

async fn drive<S>(
    shared: &SubstreamShared,
    io: S,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::Sender<Bytes>,
    close_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let framed = Framed::new(io, LengthPrefixedCodec::new(shared.max_notification_size));
    let (sink, stream) = framed.split::<Bytes>();

    tokio::join!(
        read_loop(shared, stream, inbound),
        write_loop(shared, sink, outbound, close_timeout),
    );
    trace!(target: "notifications::substream", id = %shared.id, "Driver finished");
}

async fn read_loop<St>(shared: &SubstreamShared, mut stream: St, inbound: mpsc::Sender<Bytes>)
where
    St: Stream<Item = Result<Bytes, FrameError>> + Unpin,
{
    let mut inbound = Some(inbound);
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.closing() => return,
            next = stream.next() => next,
        };

        let notification = match next {
            Some(Ok(notification)) => notification,
            Some(Err(error)) => {
                shared.fail(error.into());
                return;
            }
            None => {
                debug!(target: "notifications::substream", id = %shared.id, peer = %shared.key.peer, "Remote closed substream");
                shared.request_close();
                return;
            }
        };
        shared.metrics.notification_received(notification.len());

        let Some(tx) = &inbound else {
            continue;
        };
        // A full channel parks the reader here, which stops reads from the transport.
        let delivered = tokio::select! {
            biased;
            _ = shared.closing() => return,
            sent = tx.send(notification) => sent.is_ok(),
        };
        if !delivered {
            trace!(target: "notifications::substream", id = %shared.id, "Receiver dropped, discarding inbound notifications");
            inbound = None;
        }
    }
}

async fn write_loop<Si>(
    shared: &SubstreamShared,
    mut sink: Si,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    close_timeout: Duration,
) where
    Si: Sink<Bytes, Error = FrameError> + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.closing() => break,
            next = outbound.recv() => next,
        };
        let Some(item) = next else {
            break;
        };

        let result = tokio::select! {
            biased;
            _ = shared.failed() => return,
            _ = closing_deadline(shared, close_timeout) => {
                debug!(target: "notifications::substream", id = %shared.id, "Close timed out with a write pending");
                return;
            }
            result = write_one(shared, &mut sink, item) => result,
        };
        if let Err(error) = result {
            shared.fail(error);
            return;
        }
    }

    if shared.state() == SubstreamState::Failed {
        return;
    }

    // Flush what senders already handed over, then close our half.
    let drain = async {
        while let Ok(item) = outbound.try_recv() {
            write_one(shared, &mut sink, item).await?;
        }
        sink.close().await.map_err(NotificationError::from)
    };
    let result = tokio::select! {
        biased;
        _ = shared.failed() => return,
        result = tokio::time::timeout(close_timeout, drain) => result,
    };
    match result {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            debug!(target: "notifications::substream", id = %shared.id, %error, "Error while closing substream")
        }
        Err(_) => {
            debug!(target: "notifications::substream", id = %shared.id, ?close_timeout, "Timed out closing substream")
        }
    }
}

async fn write_one<Si>(
    shared: &SubstreamShared,
    sink: &mut Si,
    item: Outbound,
) -> Result<(), NotificationError>
where
    Si: Sink<Bytes, Error = FrameError> + Unpin,
{
    let Outbound { payload, permit } = item;
    let len = payload.len();
    sink.send(payload).await?;
    // Credit comes back only once the frame is fully written and flushed.
    drop(permit);
    shared.metrics.notification_sent(len);
    Ok(())
}

async fn closing_deadline(shared: &SubstreamShared, timeout: Duration) {
    shared.closing().await;
    tokio::time::sleep(timeout).await;
}
