//! Canned demo participants.
//!
//! Two scripted personas that answer by keyword and take turns asking
//! questions: a "simulation" that reports learning-pattern observations and a
//! "chatbot" that relates them to education.

use crate::communicator::{Communicator, CommunicatorStats, communicator_pair};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parley_core::{Message, MessageHandler};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const INSIGHTS: [&str; 4] = [
    "Detecting high-frequency learning patterns in mathematical sequences",
    "Observing emergent creativity patterns in problem-solving approaches",
    "Analyzing cognitive load distribution across different learning modalities",
    "Identifying optimal spacing intervals for knowledge retention",
];

const EDUCATIONAL_RESPONSES: [&str; 4] = [
    "That's fascinating! We could use this for adaptive learning systems that adjust to student progress",
    "This insight could help create personalized learning experiences for different cognitive styles",
    "We might apply this to develop better assessment tools that measure true understanding",
    "This pattern could inform how we design collaborative learning environments",
];

const CHATBOT_QUESTIONS: [&str; 4] = [
    "What learning patterns are most effective for mathematical concepts?",
    "How can we identify when students are struggling with comprehension?",
    "What insights do you have about optimal learning sequences?",
    "How might your analysis help with personalized education?",
];

/// A scripted participant.
pub trait Persona: MessageHandler {
    /// The next question this persona wants to ask.
    fn next_question(&self) -> String;

    /// Appends a line to the persona's transcript.
    fn record(&self, entry: String);

    fn transcript(&self) -> Vec<String>;
}

#[derive(Default)]
struct Script {
    transcript: Vec<String>,
    answers_given: usize,
    questions_asked: usize,
}

/// Shared bookkeeping for the canned personas.
#[derive(Default)]
struct ScriptLog(Mutex<Script>);

impl ScriptLog {
    fn with<T>(&self, f: impl FnOnce(&mut Script) -> T) -> T {
        let mut script = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut script)
    }

    fn record(&self, entry: String) {
        self.with(|script| script.transcript.push(entry));
    }

    fn transcript(&self) -> Vec<String> {
        self.with(|script| script.transcript.clone())
    }
}

/// Reports observations and answers with pattern analyses.
#[derive(Default)]
pub struct SimulationPersona {
    log: ScriptLog,
}

impl SimulationPersona {
    pub fn new() -> Self {
        Self::default()
    }

    fn respond(&self, question: &str) -> String {
        let lowered = question.to_lowercase();
        self.log.with(|script| {
            let insight = INSIGHTS[script.answers_given % INSIGHTS.len()];
            script.answers_given += 1;
            if lowered.contains("pattern") {
                format!("Current analysis shows {}", insight)
            } else if lowered.contains("learn") {
                "My neural networks are continuously adapting through recursive feedback loops and meta-learning algorithms".to_string()
            } else if lowered.contains("educational") {
                "Educational applications include personalized learning paths, adaptive difficulty adjustment, and real-time comprehension assessment".to_string()
            } else {
                format!("Processing query through fractal analysis... {}", insight)
            }
        })
    }
}

#[async_trait]
impl MessageHandler for SimulationPersona {
    async fn on_question(&self, question: &Message) -> Result<Option<String>> {
        self.log.record(format!("Received: {}", question.content));
        let response = self.respond(&question.content);
        self.log.record(format!("Responded: {}", response));
        Ok(Some(response))
    }

    async fn on_answer(&self, answer: &Message) -> Result<()> {
        self.log.record(format!("Answer: {}", answer.content));
        Ok(())
    }

    async fn on_timeout(&self, question: &Message) -> Result<()> {
        self.log.record(format!("Unanswered: {}", question.content));
        Ok(())
    }
}

impl Persona for SimulationPersona {
    fn next_question(&self) -> String {
        self.log.with(|script| {
            let insight = INSIGHTS[script.questions_asked % INSIGHTS.len()];
            script.questions_asked += 1;
            format!(
                "I'm observing: {}. How might this apply to student learning?",
                insight
            )
        })
    }

    fn record(&self, entry: String) {
        self.log.record(entry);
    }

    fn transcript(&self) -> Vec<String> {
        self.log.transcript()
    }
}

/// Relates whatever it hears to education.
#[derive(Default)]
pub struct ChatbotPersona {
    log: ScriptLog,
}

impl ChatbotPersona {
    pub fn new() -> Self {
        Self::default()
    }

    fn respond(&self, question: &str) -> String {
        let lowered = question.to_lowercase();
        self.log.with(|script| {
            let base = EDUCATIONAL_RESPONSES[script.answers_given % EDUCATIONAL_RESPONSES.len()];
            script.answers_given += 1;
            let suffix = if lowered.contains("pattern") {
                "Pattern recognition is fundamental to learning!"
            } else if lowered.contains("creative") {
                "Creativity enhances problem-solving skills in students!"
            } else if lowered.contains("cognitive") {
                "Understanding cognitive load helps optimize learning!"
            } else {
                "This could revolutionize educational technology!"
            };
            format!("{} {}", base, suffix)
        })
    }
}

#[async_trait]
impl MessageHandler for ChatbotPersona {
    async fn on_question(&self, question: &Message) -> Result<Option<String>> {
        self.log.record(format!("Received: {}", question.content));
        let response = self.respond(&question.content);
        self.log.record(format!("Responded: {}", response));
        Ok(Some(response))
    }

    async fn on_answer(&self, answer: &Message) -> Result<()> {
        self.log.record(format!("Answer: {}", answer.content));
        Ok(())
    }
}

impl Persona for ChatbotPersona {
    fn next_question(&self) -> String {
        self.log.with(|script| {
            let question = CHATBOT_QUESTIONS[script.questions_asked % CHATBOT_QUESTIONS.len()];
            script.questions_asked += 1;
            question.to_string()
        })
    }

    fn record(&self, entry: String) {
        self.log.record(entry);
    }

    fn transcript(&self) -> Vec<String> {
        self.log.transcript()
    }
}

/// Every `interval`, redials the peer if needed and asks the persona's next
/// question when the conversation allows it. Runs until `cancel` fires.
pub async fn ask_periodically<P: Persona>(
    comm: &Communicator,
    persona: &P,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if !comm.has_client_connection() && comm.config().target_port.is_some() {
            comm.connect_as_client().await;
        }
        if !comm.is_ready_to_send_question() {
            debug!(name = %comm.name(), "Still waiting for an answer; skipping this round");
            continue;
        }

        let question = persona.next_question();
        if comm.send_question(question.clone()).await.is_some() {
            persona.record(format!("Asked: {}", question));
        }
    }
}

/// One participant's outcome of a demo run.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantReport {
    pub stats: CommunicatorStats,
    pub transcript: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub simulation: ParticipantReport,
    pub chatbot: ParticipantReport,
}

/// Runs a simulation/chatbot pair on localhost for `duration`, each asking a
/// question every `interval`.
pub async fn run_demo(
    first_port: u16,
    second_port: u16,
    duration: Duration,
    interval: Duration,
) -> Result<DemoReport> {
    let (simulation, chatbot) = communicator_pair(first_port, second_port);
    let simulation_persona = Arc::new(SimulationPersona::new());
    let chatbot_persona = Arc::new(ChatbotPersona::new());
    simulation.set_handler(simulation_persona.clone());
    chatbot.set_handler(chatbot_persona.clone());

    simulation
        .start()
        .await
        .context("Failed to start simulation server")?;
    chatbot
        .start()
        .await
        .context("Failed to start chatbot server")?;
    simulation.connect_as_client().await;
    chatbot.connect_as_client().await;
    info!(first_port, second_port, "Demo participants connected");

    let cancel = CancellationToken::new();
    // Offset the chatbot so the two do not always ask at the same instant.
    let chatbot_interval = interval + interval / 3;
    tokio::join!(
        ask_periodically(&simulation, simulation_persona.as_ref(), interval, cancel.clone()),
        ask_periodically(&chatbot, chatbot_persona.as_ref(), chatbot_interval, cancel.clone()),
        async {
            tokio::time::sleep(duration).await;
            cancel.cancel();
        },
    );

    let report = DemoReport {
        simulation: ParticipantReport {
            stats: simulation.stats().await?,
            transcript: simulation_persona.transcript(),
        },
        chatbot: ParticipantReport {
            stats: chatbot.stats().await?,
            transcript: chatbot_persona.transcript(),
        },
    };

    simulation.stop().await;
    chatbot.stop().await;
    Ok(report)
}
