use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};
use tracklink::error::{Error, Result};
use tracklink::stream::{
    Connection, ConnectionStatus, ConnectionSupervisor, Frame, ReconnectPolicy, SupervisorConfig,
    Transport,
};

use ConnectionStatus::{Connected, Connecting, Disconnected, Retrying};

type FrameSender = mpsc::UnboundedSender<Result<Frame>>;

enum Script {
    Refuse,
    Accept(mpsc::UnboundedReceiver<Result<Frame>>),
}

/// Plays back a scripted sequence of connect outcomes; refuses once exhausted
struct MockTransport {
    script: Mutex<VecDeque<Script>>,
    attempts: Mutex<Vec<Instant>>,
    sent: Arc<Mutex<Vec<Bytes>>>,
    closes: Arc<AtomicUsize>,
}

impl MockTransport {
    fn new(script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            attempts: Mutex::new(Vec::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    /// Seconds between consecutive connect attempts
    fn attempt_gaps(&self) -> Vec<u64> {
        let attempts = self.attempts.lock().unwrap();
        attempts
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs())
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        self.attempts.lock().unwrap().push(Instant::now());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Script::Accept(frames)) => Ok(Box::new(MockConnection {
                frames,
                sent: self.sent.clone(),
                closes: self.closes.clone(),
            })),
            Some(Script::Refuse) | None => Err(Error::Transport("connection refused".to_string())),
        }
    }
}

struct MockConnection {
    frames: mpsc::UnboundedReceiver<Result<Frame>>,
    sent: Arc<Mutex<Vec<Bytes>>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, payload: Bytes) -> Result<()> {
        self.sent.lock().unwrap().push(payload);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        self.frames.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn accept() -> (FrameSender, Script) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Script::Accept(rx))
}

fn exact_config() -> SupervisorConfig {
    SupervisorConfig {
        policy: ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 2.0, 0.0)
            .unwrap(),
        ..SupervisorConfig::default()
    }
}

fn record_transitions(
    supervisor: &ConnectionSupervisor,
) -> Arc<Mutex<Vec<(ConnectionStatus, ConnectionStatus)>>> {
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = transitions.clone();
    supervisor.on_status_change(move |previous, next| {
        sink.lock().unwrap().push((previous, next));
    });
    transitions
}

async fn wait_for_status(supervisor: &ConnectionSupervisor, wanted: ConnectionStatus) {
    let mut status_rx = supervisor.subscribe_status();
    timeout(
        Duration::from_secs(600),
        status_rx.wait_for(|status| *status == wanted),
    )
    .await
    .expect("status not reached in time")
    .expect("status channel closed");
}

#[tokio::test(start_paused = true)]
async fn test_backoff_doubles_then_caps() {
    let transport = MockTransport::new(Vec::new());
    let config = exact_config().with_max_attempts(9).unwrap();
    let supervisor = ConnectionSupervisor::new(transport.clone(), config);

    assert_eq!(supervisor.start().await, Retrying);
    wait_for_status(&supervisor, Disconnected).await;

    assert_eq!(transport.attempt_count(), 9);
    assert_eq!(transport.attempt_gaps(), vec![1, 2, 4, 8, 16, 32, 60, 60]);
}

#[tokio::test(start_paused = true)]
async fn test_connect_delivers_messages_in_registration_order() {
    let (frames, script) = accept();
    let transport = MockTransport::new(vec![script]);
    let supervisor = ConnectionSupervisor::new(transport.clone(), exact_config());

    let seen = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second"] {
        let seen = seen.clone();
        supervisor.on_message(move |payload| {
            seen.lock()
                .unwrap()
                .push(format!("{name}:{}", String::from_utf8_lossy(payload)));
        });
    }

    assert_eq!(supervisor.start().await, Connected);

    frames.send(Ok(Frame::Data(Bytes::from_static(b"a")))).unwrap();
    frames.send(Ok(Frame::KeepAlive)).unwrap();
    frames.send(Ok(Frame::Data(Bytes::from_static(b"b")))).unwrap();
    sleep(Duration::from_millis(10)).await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec!["first:a", "second:a", "first:b", "second:b"]
    );
    assert_eq!(supervisor.status(), Connected);

    supervisor.stop().await;
    assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_silence_forces_retry() {
    let (_frames, first) = accept();
    let (_frames2, second) = accept();
    let transport = MockTransport::new(vec![first, second]);
    let supervisor = ConnectionSupervisor::new(transport.clone(), exact_config());
    let transitions = record_transitions(&supervisor);

    assert_eq!(supervisor.start().await, Connected);
    let connected_at = Instant::now();

    wait_for_status(&supervisor, Retrying).await;
    assert_eq!(connected_at.elapsed(), Duration::from_secs(25));
    // The silent connection was force-closed
    assert_eq!(transport.closes.load(Ordering::SeqCst), 1);

    wait_for_status(&supervisor, Connected).await;
    assert_eq!(transport.attempt_gaps(), vec![26]);

    supervisor.stop().await;
    assert_eq!(
        *transitions.lock().unwrap(),
        vec![
            (Disconnected, Connecting),
            (Connecting, Connected),
            (Connected, Retrying),
            (Retrying, Connecting),
            (Connecting, Connected),
            (Connected, Disconnected),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_frames_hold_the_connection_open() {
    let (frames, script) = accept();
    let transport = MockTransport::new(vec![script]);
    let supervisor = ConnectionSupervisor::new(transport.clone(), exact_config());
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    supervisor.on_message(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    supervisor.start().await;
    for _ in 0..6 {
        sleep(Duration::from_secs(20)).await;
        frames.send(Ok(Frame::KeepAlive)).unwrap();
    }

    // Two minutes in, never silent for 25s
    assert_eq!(supervisor.status(), Connected);
    assert_eq!(transport.attempt_count(), 1);
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_backoff() {
    let (frames, accepted) = accept();
    let transport = MockTransport::new(vec![Script::Refuse, Script::Refuse, accepted]);
    let supervisor = ConnectionSupervisor::new(transport.clone(), exact_config());

    assert_eq!(supervisor.start().await, Retrying);
    wait_for_status(&supervisor, Connected).await;
    assert_eq!(transport.attempt_gaps(), vec![1, 2]);

    // Remote close after a successful connect: next wait is the initial delay again
    drop(frames);
    wait_for_status(&supervisor, Retrying).await;
    let lost_at = Instant::now();
    sleep(Duration::from_millis(1_500)).await;

    assert_eq!(transport.attempt_count(), 4);
    assert_eq!(transport.attempt_gaps()[2], 1);
    assert!(lost_at.elapsed() >= Duration::from_secs(1));
    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_becomes_retry() {
    let (frames, first) = accept();
    let (_frames2, second) = accept();
    let transport = MockTransport::new(vec![first, second]);
    let supervisor = ConnectionSupervisor::new(transport.clone(), exact_config());

    supervisor.start().await;
    frames
        .send(Err(Error::Transport("connection reset by peer".to_string())))
        .unwrap();

    wait_for_status(&supervisor, Retrying).await;
    wait_for_status(&supervisor, Connected).await;
    assert_eq!(transport.attempt_count(), 2);
    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_pending_reconnect() {
    let transport = MockTransport::new(Vec::new());
    let supervisor = ConnectionSupervisor::new(transport.clone(), exact_config());
    let transitions = record_transitions(&supervisor);

    assert_eq!(supervisor.start().await, Retrying);
    supervisor.stop().await;
    assert_eq!(supervisor.status(), Disconnected);
    let recorded = transitions.lock().unwrap().len();

    sleep(Duration::from_secs(300)).await;
    assert_eq!(transport.attempt_count(), 1);
    assert_eq!(transitions.lock().unwrap().len(), recorded);
    assert_eq!(
        transitions.lock().unwrap().last(),
        Some(&(Retrying, Disconnected))
    );

    // Stopping twice is harmless
    supervisor.stop().await;
    assert_eq!(transitions.lock().unwrap().len(), recorded);
}

#[tokio::test(start_paused = true)]
async fn test_start_is_idempotent_while_connected() {
    let (_frames, script) = accept();
    let transport = MockTransport::new(vec![script]);
    let supervisor = ConnectionSupervisor::new(transport.clone(), exact_config());

    assert_eq!(supervisor.start().await, Connected);
    assert_eq!(supervisor.start().await, Connected);
    assert_eq!(transport.attempt_count(), 1);
    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_send_reaches_live_connection() {
    let (_frames, script) = accept();
    let transport = MockTransport::new(vec![script]);
    let supervisor = ConnectionSupervisor::new(transport.clone(), exact_config());

    supervisor.start().await;
    supervisor
        .send(Bytes::from_static(b"{\"subscribe\":true}"))
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;

    assert_eq!(
        *transport.sent.lock().unwrap(),
        vec![Bytes::from_static(b"{\"subscribe\":true}")]
    );

    supervisor.stop().await;
    assert!(matches!(
        supervisor.send(Bytes::from_static(b"late")).await,
        Err(Error::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_panicking_handler_ends_session_and_reconnects() {
    let (frames, first) = accept();
    let (_frames2, second) = accept();
    let transport = MockTransport::new(vec![first, second]);
    let supervisor = ConnectionSupervisor::new(transport.clone(), exact_config());
    let transitions = record_transitions(&supervisor);

    let later_calls = Arc::new(AtomicUsize::new(0));
    supervisor.on_message(|_| panic!("bad payload"));
    let counter = later_calls.clone();
    supervisor.on_message(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(supervisor.start().await, Connected);
    frames.send(Ok(Frame::Data(Bytes::from_static(b"x")))).unwrap();

    wait_for_status(&supervisor, Retrying).await;
    assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    // Handlers after the panicking one are skipped for that frame
    assert_eq!(later_calls.load(Ordering::SeqCst), 0);

    wait_for_status(&supervisor, Connected).await;
    assert_eq!(transport.attempt_count(), 2);
    assert_eq!(transport.attempt_gaps(), vec![1]);

    // stop() does not re-raise the handler panic
    supervisor.stop().await;
    assert_eq!(
        transitions.lock().unwrap().last(),
        Some(&(Connected, Disconnected))
    );
}

#[tokio::test(start_paused = true)]
async fn test_panicking_status_handler_does_not_stall_transitions() {
    let (_frames, script) = accept();
    let transport = MockTransport::new(vec![script]);
    let supervisor = ConnectionSupervisor::new(transport.clone(), exact_config());
    supervisor.on_status_change(|_, _| panic!("observer failed"));
    let transitions = record_transitions(&supervisor);

    assert_eq!(supervisor.start().await, Connected);
    supervisor.stop().await;

    assert_eq!(
        *transitions.lock().unwrap(),
        vec![
            (Disconnected, Connecting),
            (Connecting, Connected),
            (Connected, Disconnected),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_hanging_handshake_times_out() {
    struct HangingTransport;

    #[async_trait]
    impl Transport for HangingTransport {
        async fn connect(&self) -> Result<Box<dyn Connection>> {
            std::future::pending().await
        }
    }

    let config = SupervisorConfig {
        connect_timeout: Duration::from_secs(5),
        ..exact_config()
    };
    let supervisor = ConnectionSupervisor::new(Arc::new(HangingTransport), config);
    let started = Instant::now();

    assert_eq!(supervisor.start().await, Retrying);
    assert_eq!(started.elapsed(), Duration::from_secs(5));
    supervisor.stop().await;
}
