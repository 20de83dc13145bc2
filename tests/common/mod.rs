#![allow(dead_code)]

//! Shared test doubles: a scriptable chat client, a canned solver and a
//! scripted handler, plus the wiring to stand up a runner against an
//! in-memory store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use rollcall::chat::{ChatClient, ChatClientManager, ChatEvent};
use rollcall::model::{TaskResult, TaskRun};
use rollcall::router::ConversationRouter;
use rollcall::runner::TaskRunner;
use rollcall::settings::Settings;
use rollcall::solver::ChallengeSolver;
use rollcall::store::Store;
use rollcall::tasks::{Collaborators, HandlerRegistry, TaskContext, TaskHandler};

pub const PEER_ID: i64 = 7777;

pub fn text_event(message_id: i64, text: &str) -> ChatEvent {
    ChatEvent {
        peer_id: PEER_ID,
        sender_id: Some(PEER_ID),
        message_id,
        text: text.into(),
        has_photo: false,
        buttons: Vec::new(),
    }
}

pub fn photo_event(message_id: i64, text: &str, buttons: Vec<Vec<String>>) -> ChatEvent {
    ChatEvent {
        peer_id: PEER_ID,
        sender_id: Some(PEER_ID),
        message_id,
        text: text.into(),
        has_photo: true,
        buttons,
    }
}

pub fn button_event(message_id: i64, text: &str, labels: &[&str]) -> ChatEvent {
    ChatEvent {
        peer_id: PEER_ID,
        sender_id: Some(PEER_ID),
        message_id,
        text: text.into(),
        has_photo: false,
        buttons: vec![labels.iter().map(|l| l.to_string()).collect()],
    }
}

/// Chat client whose replies are scripted in advance. Each `send_message`
/// emits the next queued batch of inbound events; each `click` emits its own
/// batch and answers with the configured callback text.
pub struct FakeChatClient {
    event_tx: mpsc::UnboundedSender<ChatEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<ChatEvent>>>,
    send_batches: Mutex<VecDeque<Vec<ChatEvent>>>,
    click_batches: Mutex<VecDeque<Vec<ChatEvent>>>,
    click_answer: Mutex<Option<String>>,
    pub sent: Mutex<Vec<(String, String)>>,
    pub clicked: Mutex<Vec<String>>,
}

impl FakeChatClient {
    pub fn new() -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            send_batches: Mutex::new(VecDeque::new()),
            click_batches: Mutex::new(VecDeque::new()),
            click_answer: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            clicked: Mutex::new(Vec::new()),
        })
    }

    pub fn on_send_reply(&self, events: Vec<ChatEvent>) {
        self.send_batches.lock().unwrap().push_back(events);
    }

    pub fn on_click_reply(&self, events: Vec<ChatEvent>) {
        self.click_batches.lock().unwrap().push_back(events);
    }

    pub fn set_click_answer(&self, answer: &str) {
        *self.click_answer.lock().unwrap() = Some(answer.to_string());
    }

    /// Inject inbound events directly, as if the remote side spoke first.
    pub fn push_events(&self, events: Vec<ChatEvent>) {
        self.emit(events);
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }

    fn emit(&self, events: Vec<ChatEvent>) {
        for event in events {
            let _ = self.event_tx.send(event);
        }
    }
}

#[async_trait]
impl ChatClient for FakeChatClient {
    async fn resolve_peer(&self, _target: &str) -> Result<i64> {
        Ok(PEER_ID)
    }

    async fn send_message(&self, target: &str, text: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((target.to_string(), text.to_string()));
        let batch = self.send_batches.lock().unwrap().pop_front();
        if let Some(events) = batch {
            self.emit(events);
        }
        Ok(())
    }

    async fn download_media(&self, _event: &ChatEvent) -> Result<Vec<u8>> {
        Ok(vec![0xFF, 0xD8, 0xFF])
    }

    async fn click(&self, _event: &ChatEvent, label: &str) -> Result<Option<String>> {
        self.clicked.lock().unwrap().push(label.to_string());
        let batch = self.click_batches.lock().unwrap().pop_front();
        if let Some(events) = batch {
            self.emit(events);
        }
        Ok(self.click_answer.lock().unwrap().clone())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChatEvent> {
        match self.event_rx.lock().unwrap().take() {
            Some(rx) => rx,
            // A second subscription gets a channel that never produces.
            None => mpsc::unbounded_channel().1,
        }
    }
}

pub struct FakeChatManager {
    client: Arc<FakeChatClient>,
}

impl FakeChatManager {
    pub fn new(client: Arc<FakeChatClient>) -> Arc<Self> {
        Arc::new(Self { client })
    }
}

#[async_trait]
impl ChatClientManager for FakeChatManager {
    async fn acquire(&self, _session_name: &str) -> Result<Arc<dyn ChatClient>> {
        Ok(Arc::clone(&self.client) as Arc<dyn ChatClient>)
    }
}

pub struct FakeSolver {
    pub answer: String,
}

#[async_trait]
impl ChallengeSolver for FakeSolver {
    async fn solve(&self, _image: &[u8], _options: &[String]) -> Result<String> {
        Ok(self.answer.clone())
    }
}

/// One scripted outcome per attempt; an exhausted script succeeds.
#[derive(Debug, Clone)]
pub enum Scripted {
    Succeed(&'static str),
    FailResult(&'static str),
    Error(&'static str),
    Hang(u64),
}

pub struct ScriptHandler {
    outcomes: Mutex<VecDeque<Scripted>>,
    pub calls: AtomicUsize,
    reject_params: bool,
}

impl ScriptHandler {
    pub fn new(outcomes: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicUsize::new(0),
            reject_params: false,
        })
    }

    pub fn rejecting_params() -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            reject_params: true,
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for ScriptHandler {
    fn task_type(&self) -> &'static str {
        "script"
    }

    fn validate_params(&self, _params: &Value) -> Result<()> {
        if self.reject_params {
            bail!("script params rejected");
        }
        Ok(())
    }

    async fn execute(&self, _ctx: &TaskContext, _params: &Value) -> Result<TaskResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.outcomes.lock().unwrap().pop_front();
        match next {
            None => Ok(TaskResult::ok("done")),
            Some(Scripted::Succeed(msg)) => Ok(TaskResult::ok(msg)),
            Some(Scripted::FailResult(msg)) => Ok(TaskResult::fail(msg)),
            Some(Scripted::Error(msg)) => bail!("{msg}"),
            Some(Scripted::Hang(secs)) => {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                Ok(TaskResult::ok("woke up"))
            }
        }
    }
}

/// A runner wired to an in-memory store with scriptable collaborators.
pub struct TestEnv {
    pub store: Store,
    pub runner: Arc<TaskRunner>,
    pub router: Arc<ConversationRouter>,
    pub client: Arc<FakeChatClient>,
}

pub async fn env_with(registry: HandlerRegistry, solver_answer: &str) -> TestEnv {
    let store = Store::open_in_memory().await.expect("store");
    let client = FakeChatClient::new();
    let router = Arc::new(ConversationRouter::new());
    let collab = Collaborators {
        chat: FakeChatManager::new(Arc::clone(&client)),
        router: Arc::clone(&router),
        solver: Arc::new(FakeSolver {
            answer: solver_answer.to_string(),
        }),
    };
    let runner = TaskRunner::new(
        store.clone(),
        Arc::new(registry),
        Arc::new(Settings::default()),
        collab,
    );
    TestEnv {
        store,
        runner,
        router,
        client,
    }
}

/// Poll a run record until it reaches a terminal status.
pub async fn wait_terminal(store: &Store, run_id: i64) -> TaskRun {
    for _ in 0..500 {
        if let Some(run) = store.get_run(run_id).await.expect("get run") {
            if run.status.is_terminal() {
                return run;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} never reached a terminal status");
}
