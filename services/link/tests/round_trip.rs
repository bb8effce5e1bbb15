use async_trait::async_trait;
use parley_core::{ConversationState, Message, MessageHandler};
use parley_link::{Communicator, LinkConfig, communicator_pair};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Returns a port that was free a moment ago.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        if Instant::now() > deadline {
            panic!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Answers every question with `pong:<content>` and records what it sees.
#[derive(Default)]
struct Recorder {
    reply: bool,
    questions: Mutex<Vec<Message>>,
    answers: Mutex<Vec<Message>>,
    timeouts: Mutex<Vec<Message>>,
}

impl Recorder {
    fn replying() -> Arc<Self> {
        Arc::new(Self {
            reply: true,
            ..Self::default()
        })
    }

    fn silent() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn questions(&self) -> Vec<Message> {
        self.questions.lock().unwrap().clone()
    }

    fn answers(&self) -> Vec<Message> {
        self.answers.lock().unwrap().clone()
    }

    fn timeouts(&self) -> Vec<Message> {
        self.timeouts.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn on_question(&self, question: &Message) -> anyhow::Result<Option<String>> {
        self.questions.lock().unwrap().push(question.clone());
        Ok(self.reply.then(|| format!("pong:{}", question.content)))
    }

    async fn on_answer(&self, answer: &Message) -> anyhow::Result<()> {
        self.answers.lock().unwrap().push(answer.clone());
        Ok(())
    }

    async fn on_timeout(&self, question: &Message) -> anyhow::Result<()> {
        self.timeouts.lock().unwrap().push(question.clone());
        Ok(())
    }
}

/// Takes its time before answering.
struct Deliberate(Duration);

#[async_trait]
impl MessageHandler for Deliberate {
    async fn on_question(&self, question: &Message) -> anyhow::Result<Option<String>> {
        tokio::time::sleep(self.0).await;
        Ok(Some(format!("pong:{}", question.content)))
    }
}

async fn connected_pair(
    sim_handler: Arc<Recorder>,
    bot_handler: Arc<Recorder>,
) -> (Communicator, Communicator) {
    let (sim, bot) = communicator_pair(free_port(), free_port());
    sim.set_handler(sim_handler);
    bot.set_handler(bot_handler);
    sim.start().await.unwrap();
    bot.start().await.unwrap();
    assert!(sim.connect_as_client().await);
    assert!(bot.connect_as_client().await);
    eventually("both servers to register their peer", || {
        sim.connected_clients() == 1 && bot.connected_clients() == 1
    })
    .await;
    (sim, bot)
}

#[tokio::test]
async fn test_question_answer_round_trip() {
    let sim_handler = Recorder::silent();
    let bot_handler = Recorder::replying();
    let (sim, bot) = connected_pair(sim_handler.clone(), bot_handler.clone()).await;

    let id = sim.send_question("ping").await.unwrap();
    assert!(!sim.is_ready_to_send_question());

    eventually("the answer to arrive", || !sim_handler.answers().is_empty()).await;
    eventually("the simulation to become ready", || sim.is_ready_to_send_question()).await;

    let answers = sim_handler.answers();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].content, "pong:ping");
    assert_eq!(answers[0].sender, "chatbot");
    assert_eq!(answers[0].in_reply_to.as_ref(), Some(&id));

    // The question reached the chatbot over both legs but was handled once.
    let questions = bot_handler.questions();
    assert_eq!(questions.len(), 1);
    assert_eq!(questions[0].message_id, id);

    let stats = sim.stats().await.unwrap();
    assert_eq!(stats.conversation_state, ConversationState::Idle);
    assert_eq!(stats.pending_questions, 0);
    assert!(stats.cache_size >= 2);
    assert!(stats.has_client_connection);

    sim.stop().await;
    bot.stop().await;
}

#[tokio::test]
async fn test_turn_taking_over_the_network() {
    let sim_handler = Recorder::silent();
    let bot_handler = Recorder::silent();
    let (sim, bot) = connected_pair(sim_handler, bot_handler.clone()).await;

    assert!(sim.send_question("first").await.is_some());
    assert!(sim.send_question("second").await.is_none());

    eventually("the chatbot to see the question", || {
        !bot_handler.questions().is_empty()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let questions = bot_handler.questions();
    assert_eq!(questions.len(), 1);
    assert_eq!(questions[0].content, "first");
    assert_eq!(sim.conversation_state(), ConversationState::WaitingForAnswer);

    sim.stop().await;
    bot.stop().await;
}

#[tokio::test]
async fn test_connect_to_missing_peer_returns_false() {
    let port = free_port();
    let comm = Communicator::new("simulation", 0, "127.0.0.1", Some(port));

    assert!(!comm.connect_as_client().await);
    assert!(!comm.has_client_connection());
    assert!(!comm.stats().await.unwrap().has_client_connection);
}

#[tokio::test]
async fn test_unanswered_question_times_out() {
    let bot_port = free_port();
    let sim_handler = Recorder::silent();
    let sim = Communicator::with_config(
        LinkConfig::new("simulation", 0)
            .with_target("127.0.0.1", bot_port)
            .with_answer_timeout(Duration::from_millis(200)),
    );
    sim.set_handler(sim_handler.clone());

    let bot = Communicator::new("chatbot", bot_port, "127.0.0.1", None);
    bot.set_handler(Recorder::silent());
    bot.start().await.unwrap();
    assert!(sim.connect_as_client().await);

    let id = sim.send_question("hello?").await.unwrap();
    assert!(!sim.is_ready_to_send_question());

    eventually("the question to time out", || !sim_handler.timeouts().is_empty()).await;
    eventually("the simulation to become ready", || sim.is_ready_to_send_question()).await;
    assert_eq!(sim_handler.timeouts()[0].message_id, id);
    assert_eq!(sim.stats().await.unwrap().pending_questions, 0);

    sim.stop().await;
    bot.stop().await;
}

#[tokio::test]
async fn test_peer_shutdown_clears_client_connection() {
    let bot_port = free_port();
    let bot = Communicator::new("chatbot", bot_port, "127.0.0.1", None);
    bot.start().await.unwrap();

    let sim = Communicator::new("simulation", 0, "127.0.0.1", Some(bot_port));
    assert!(sim.connect_as_client().await);
    assert!(sim.has_client_connection());

    bot.stop().await;
    eventually("the client connection to drop", || !sim.has_client_connection()).await;

    sim.stop().await;
}

#[tokio::test]
async fn test_server_only_peer_answers_inbound_client() {
    let bot_port = free_port();
    let bot = Communicator::new("chatbot", bot_port, "127.0.0.1", None);
    bot.set_handler(Recorder::replying());
    bot.start().await.unwrap();

    let sim_handler = Recorder::silent();
    let sim = Communicator::new("simulation", 0, "127.0.0.1", Some(bot_port));
    sim.set_handler(sim_handler.clone());
    assert!(sim.connect_as_client().await);

    sim.send_question("over one leg").await.unwrap();
    eventually("the answer to arrive", || !sim_handler.answers().is_empty()).await;
    assert_eq!(sim_handler.answers()[0].content, "pong:over one leg");

    sim.stop().await;
    bot.stop().await;
}

#[tokio::test]
async fn test_slow_answerer_may_still_ask() {
    let (sim, bot) = communicator_pair(free_port(), free_port());
    let sim_handler = Recorder::silent();
    sim.set_handler(sim_handler.clone());
    bot.set_handler(Arc::new(Deliberate(Duration::from_millis(500))));
    sim.start().await.unwrap();
    bot.start().await.unwrap();
    assert!(sim.connect_as_client().await);
    assert!(bot.connect_as_client().await);

    sim.send_question("ping").await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    // The chatbot is still composing its answer but has not asked anything.
    assert_eq!(bot.conversation_state(), ConversationState::Idle);
    assert!(bot.is_ready_to_send_question());
    assert!(bot.send_question("meanwhile?").await.is_some());

    eventually("the slow answer to arrive", || {
        sim_handler
            .answers()
            .iter()
            .any(|answer| answer.content == "pong:ping")
    })
    .await;
    eventually("the chatbot question to reach the simulation", || {
        sim_handler
            .questions()
            .iter()
            .any(|question| question.content == "meanwhile?")
    })
    .await;

    sim.stop().await;
    bot.stop().await;
}
