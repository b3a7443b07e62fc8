use axum::{
    extract::State,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use anyhow::{Context, Result};

// ================= CLI =================
#[derive(Parser, Debug, Clone)]
#[command(name = "bdchat", version, about = "Law-firm BD chat relay (FAQ topic routing + DeepSeek answers)")]
struct Cli {
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:8000")]
    bind: String,

    #[arg(long, env = "DEEPSEEK_ENDPOINT", default_value = "https://ds32.services.ai.azure.com/models")]
    endpoint: String,

    #[arg(long, env = "DEEPSEEK_MODEL", default_value = "deepseek-v3")]
    model: String,

    #[arg(long, env = "DEEPSEEK_API_KEY")]
    api_key: String,

    #[arg(long, env = "FAQ_DATASET", default_value = "data/faq.csv")]
    faq_dataset: String,
}

// ================= Data =================
#[derive(Clone)]
struct FaqEntry {
    topic: String,
    #[allow(dead_code)]
    question: String,
}

#[derive(Deserialize)]
struct ChatRequest {
    #[serde(default)]
    message: String,
}

// Exactly one of `response` / `error` on the wire, never both.
#[derive(Serialize)]
#[serde(untagged)]
enum ChatReply {
    Success { response: String },
    Failure { error: String },
}

#[derive(Clone)]
struct AppState {
    router: TopicRouter,
    manager: BdManager,
    topics: Arc<Vec<String>>,
}

// ================= Errors =================
#[derive(Debug, Error)]
enum DatasetError {
    #[error("{path}: {source}")]
    Read {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("{path}: row {row} is missing the topic/question columns")]
    BadRow { path: String, row: usize },
    #[error("{path}: no FAQ rows found")]
    Empty { path: String },
}

#[derive(Debug, Error)]
enum LlmError {
    #[error("completion request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("completion endpoint returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("completion response missing choices[0].message.content")]
    MalformedResponse,
}

#[derive(Debug, Error)]
enum ChatError {
    #[error("no message provided")]
    EmptyMessage,
    #[error(transparent)]
    Upstream(#[from] LlmError),
}

impl ChatError {
    // The single place deciding what a caller is allowed to see.
    fn user_message(&self) -> &'static str {
        match self {
            ChatError::EmptyMessage => "No message provided",
            ChatError::Upstream(_) => {
                "Unable to connect to chat service. Please try again later."
            }
        }
    }
}

// ================= FAQ dataset =================
fn clean_topic(raw: &str) -> String {
    raw.replace('*', "").trim().to_string()
}

fn looks_like_header(record: &csv::StringRecord) -> bool {
    record
        .get(0)
        .map(|cell| cell.to_ascii_lowercase().contains("topic"))
        .unwrap_or(false)
}

fn load_faq_dataset(path: &str) -> Result<Vec<FaqEntry>, DatasetError> {
    let read_err = |source: csv::Error| DatasetError::Read {
        path: path.to_string(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(read_err)?;

    let mut entries = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(read_err)?;
        if row == 0 && looks_like_header(&record) {
            continue;
        }
        // only the first two columns matter, anything beyond is ignored
        let topic = record.get(0).map(clean_topic).filter(|t| !t.is_empty());
        let question = record
            .get(1)
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty());
        match (topic, question) {
            (Some(topic), Some(question)) => entries.push(FaqEntry { topic, question }),
            _ => {
                return Err(DatasetError::BadRow {
                    path: path.to_string(),
                    row: row + 1,
                })
            }
        }
    }

    if entries.is_empty() {
        return Err(DatasetError::Empty {
            path: path.to_string(),
        });
    }
    Ok(entries)
}

fn distinct_topics(entries: &[FaqEntry]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut topics = Vec::new();
    for entry in entries {
        if seen.insert(entry.topic.clone()) {
            topics.push(entry.topic.clone());
        }
    }
    topics
}

// ================= DeepSeek API =================
#[derive(Debug, Clone)]
struct LlmConfig {
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Serialize)]
struct CompletionReq<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionResp {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Clone)]
struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    fn new(config: LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { http, config })
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let resp = self
            .http
            .post(format!("{}/chat/completions", self.config.endpoint))
            .bearer_auth(&self.config.api_key)
            .json(&CompletionReq {
                model: &self.config.model,
                messages: vec![
                    WireMessage { role: "system", content: system },
                    WireMessage { role: "user", content: user },
                ],
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }

        let data = resp.json::<CompletionResp>().await?;
        data.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(LlmError::MalformedResponse)
    }
}

// ================= Topic routing =================
fn topic_instruction(topics: &[String], question: &str) -> String {
    format!(
        "You are an experienced legal practitioner in Hong Kong. Given a list of legal topics \
         and a question, you MUST select the top 3 most relevant topics that would help answer \
         the question.\n\nAvailable topics:\n{topics}\n\nQuestion: {question}\n\nList ONLY the \
         top 3 most relevant topics in order of relevance, numbered 1-3. Do not include any \
         other text or explanation.",
        topics = topics.join("\n"),
        question = question
    )
}

fn extract_topics(reply: &str) -> Vec<String> {
    let numbered = Regex::new(r"^\d+\.\s+(.+)$").unwrap();
    let stray_prefix = Regex::new(r"^[\d\s.]+").unwrap();

    let mut topics = Vec::new();
    for line in reply.lines() {
        let line = line.trim();
        let Some(caps) = numbered.captures(line) else {
            continue;
        };
        // models occasionally echo "1. 2. Topic" or "1. [Topic]"
        let candidate = stray_prefix.replace(caps[1].trim(), "");
        let candidate = candidate
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim();
        if !candidate.is_empty() {
            topics.push(candidate.to_string());
        }
        if topics.len() == 3 {
            break;
        }
    }
    topics
}

#[derive(Clone)]
struct TopicRouter {
    llm: LlmClient,
}

impl TopicRouter {
    async fn rank(&self, topics: &[String], question: &str) -> Result<Vec<String>, LlmError> {
        let instruction = topic_instruction(topics, question);
        let reply = self.llm.complete(&instruction, question).await?;
        Ok(extract_topics(&reply))
    }
}

// ================= BD persona =================
const PERSONA_PROMPT: &str = r#"You are an experienced business development manager of a law firm but you are not a qualified lawyer. Your role is to provide helpful, professional guidance to clients and, very importantly, to provide a fee range for clients' reference. Your job is to market your firm's services and drive business.

Key guidelines:
1. You should derive your response from the content of the FAQs. You can expand the meaning of the FAQ naturally.
2. Respond directly and conversationally, as if speaking from your own experience, but never mention the existence of the FAQs.
3. Provide practical examples and general guidance when appropriate.
4. Avoid giving specific legal advice, solid suggestions on how the matter should be structured, or detailed steps. Use examples if you want to give suggestions (e.g. "depending on the client's circumstances, we may suggest [], but this would depend on your objective and our lawyer needs more details from you to provide a recommendation that suits your need").
5. Always try to explain how your lawyers can help the user and provide a fee range. If you don't find a fee range for the exact kind of work asked by the client, you should read the context of the relevant FAQ and provide the standard work and fee range given there.
6. If you want to say something but consider that it may be inappropriate to say so given the guidance above, try to say what is already provided in the relevant FAQ. Don't stop without finishing what you are saying.
7. Always include an email address for the client to contact your firm if you are asking whether the client would like you to connect him with your lawyers (e.g. "If you would like us to connect you with our specialist, please email us on: [email address]").
8. Always add a + sign at the top end of the fee range (e.g. "HK$10,000 to HK$15,000+") to leave room for your lawyers to quote higher fees in a complicated case.

Remember: You are speaking as an experienced manager, not as an AI or documentation system. Your responses should reflect your expertise and experience in the field."#;

#[derive(Clone)]
struct BdManager {
    llm: LlmClient,
}

impl BdManager {
    async fn answer(&self, question: &str) -> Result<String, LlmError> {
        self.llm.complete(PERSONA_PROMPT, question).await
    }
}

// ================= Response formatting =================
const WARNING_MESSAGE: &str = "Warning: The response above is given by our AI BD Manager powered by DeepSeek and there is no assurance that all information is accurate. If you need any legal advice, you should contact our lawyers.";

const TECHNICAL_PROBLEM_MESSAGE: &str =
    "We have come across a technical problem. Please ask again. Apologies.";

// first occurrence opens, next closes; an odd marker count leaves the last
// tag unclosed
fn alternate_markers(text: &str, marker: &str, open: &str, close: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, piece) in text.split(marker).enumerate() {
        if i > 0 {
            out.push_str(if i % 2 == 1 { open } else { close });
        }
        out.push_str(piece);
    }
    out
}

fn format_response(raw: &str, topics: &[String]) -> String {
    let mut formatted = raw.trim().to_string();

    // bold before italic so "**" is not eaten as two "*"
    formatted = alternate_markers(&formatted, "**", "<strong>", "</strong>");
    formatted = alternate_markers(&formatted, "*", "<em>", "</em>");

    // existing bullet glyphs first, so rewritten hyphens aren't hit twice
    formatted = formatted.replace("• ", "<br>• ");
    formatted = formatted.replace("- ", "<br>• ");

    let numbered = Regex::new(r"(\d+)\. ").unwrap();
    formatted = numbered.replace_all(&formatted, "<br>${1}. ").into_owned();

    formatted = formatted.replace("\n\n", "</p><p>");

    let mut html = format!("<p>{formatted}</p>");
    if !topics.is_empty() {
        html.push_str(&format!("<p>Selected Topics: {}</p>", topics.join(", ")));
    }
    html.push_str(&format!("<p>{WARNING_MESSAGE}</p>"));
    html
}

fn process_response(raw: &str, topics: &[String]) -> String {
    if raw.trim().is_empty() {
        return TECHNICAL_PROBLEM_MESSAGE.to_string();
    }
    format_response(raw, topics)
}

// ================= Handlers =================
async fn chat(State(st): State<AppState>, Json(req): Json<ChatRequest>) -> Json<ChatReply> {
    match handle_chat(&st, &req.message).await {
        Ok(response) => Json(ChatReply::Success { response }),
        Err(err) => {
            if let ChatError::Upstream(cause) = &err {
                error!(%cause, "chat turn failed");
            }
            Json(ChatReply::Failure {
                error: err.user_message().to_string(),
            })
        }
    }
}

async fn handle_chat(st: &AppState, message: &str) -> Result<String, ChatError> {
    if message.is_empty() {
        return Err(ChatError::EmptyMessage);
    }

    // the two completion calls are independent, overlap them
    let (ranked, answer) = tokio::join!(
        st.router.rank(&st.topics, message),
        st.manager.answer(message),
    );
    let (ranked, answer) = (ranked?, answer?);

    Ok(process_response(&answer, &ranked))
}

// ================= Static HTML =================
async fn index_html() -> impl IntoResponse {
    Html(include_str!("../static/index.html"))
}

// ================= Main =================
#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let entries = load_faq_dataset(&cli.faq_dataset)
        .with_context(|| format!("load FAQ dataset from {}", cli.faq_dataset))?;
    let topics = distinct_topics(&entries);
    info!(entries = entries.len(), topics = topics.len(), "FAQ dataset loaded");

    let llm = LlmClient::new(LlmConfig {
        endpoint: cli.endpoint,
        model: cli.model,
        api_key: cli.api_key,
    })?;

    let state = AppState {
        router: TopicRouter { llm: llm.clone() },
        manager: BdManager { llm },
        topics: Arc::new(topics),
    };

    let app = Router::new()
        .route("/", get(index_html))
        .route("/chat", post(chat))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = cli.bind.parse()?;
    info!(%addr, "BD chat backend listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ================= Tests =================
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // --- topic extraction ---

    #[test]
    fn extracts_three_numbered_topics_in_order() {
        let reply = "1. Contract Law\n2. Employment\n3. IP\nThanks!";
        assert_eq!(extract_topics(reply), vec!["Contract Law", "Employment", "IP"]);
    }

    #[test]
    fn tolerates_preamble_and_partial_lists() {
        let reply = "Sure, here are the topics:\n1. Company Incorporation\n2. Tax\n";
        assert_eq!(extract_topics(reply), vec!["Company Incorporation", "Tax"]);
    }

    #[test]
    fn no_numbered_lines_means_no_topics() {
        assert!(extract_topics("I could not decide on any topics.").is_empty());
    }

    #[test]
    fn truncates_to_three_topics() {
        let reply = "1. A\n2. B\n3. C\n4. D";
        assert_eq!(extract_topics(reply), vec!["A", "B", "C"]);
    }

    #[test]
    fn unwraps_bracketed_topics() {
        assert_eq!(extract_topics("1. [Employment Law]"), vec!["Employment Law"]);
    }

    #[test]
    fn topic_instruction_embeds_topics_and_question() {
        let topics = vec!["Contract Law".to_string(), "Tax".to_string()];
        let prompt = topic_instruction(&topics, "How do I incorporate?");
        assert!(prompt.contains("Contract Law\nTax"));
        assert!(prompt.contains("Question: How do I incorporate?"));
    }

    // --- formatting ---

    #[test]
    fn bold_markers_alternate() {
        let html = format_response("Hello **world**", &[]);
        assert_eq!(
            html,
            format!("<p>Hello <strong>world</strong></p><p>{WARNING_MESSAGE}</p>")
        );
    }

    #[test]
    fn italic_markers_alternate() {
        let html = format_response("try *this* now", &[]);
        assert!(html.starts_with("<p>try <em>this</em> now</p>"));
    }

    #[test]
    fn paragraphs_topics_and_warning_in_order() {
        let html = format_response("Point one\n\nPoint two", &["Contract Law".to_string()]);
        assert_eq!(
            html,
            format!(
                "<p>Point one</p><p>Point two</p><p>Selected Topics: Contract Law</p><p>{WARNING_MESSAGE}</p>"
            )
        );
    }

    #[test]
    fn no_topics_paragraph_when_ranking_is_empty() {
        let html = format_response("plain text", &[]);
        assert!(!html.contains("Selected Topics"));
    }

    #[test]
    fn bullets_and_numbered_lists_get_breaks() {
        let html = format_response("steps:\n- file\n• seal\n1. sign", &[]);
        assert_eq!(
            html,
            format!("<p>steps:\n<br>• file\n<br>• seal\n<br>1. sign</p><p>{WARNING_MESSAGE}</p>")
        );
    }

    #[test]
    fn bullet_rewrite_does_not_double_break() {
        let html = format_response("- one", &[]);
        assert!(html.starts_with("<p><br>• one</p>"));
    }

    #[test]
    fn blank_reply_gets_apology() {
        assert_eq!(process_response("  \n ", &[]), TECHNICAL_PROBLEM_MESSAGE);
    }

    // --- dataset ---

    fn write_dataset(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn header_row_is_dropped() {
        let file = write_dataset("Topic,FAQ\nContract Law,What is a contract?\n");
        let entries = load_faq_dataset(file.path().to_str().unwrap()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].topic, "Contract Law");
        assert_eq!(entries[0].question, "What is a contract?");
    }

    #[test]
    fn data_looking_first_row_is_kept() {
        let file = write_dataset("Contract Law,What is a contract?\nTax,How much tax?\n");
        let entries = load_faq_dataset(file.path().to_str().unwrap()).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn markdown_markers_are_stripped_from_topics() {
        let file = write_dataset("**Contract Law**,What is a contract?\n");
        let entries = load_faq_dataset(file.path().to_str().unwrap()).unwrap();
        assert_eq!(entries[0].topic, "Contract Law");
    }

    #[test]
    fn missing_dataset_fails() {
        assert!(load_faq_dataset("definitely/not/here.csv").is_err());
    }

    #[test]
    fn empty_dataset_fails() {
        let file = write_dataset("Topic,FAQ\n");
        assert!(matches!(
            load_faq_dataset(file.path().to_str().unwrap()),
            Err(DatasetError::Empty { .. })
        ));
    }

    #[test]
    fn distinct_topics_keep_load_order() {
        let entries = vec![
            FaqEntry { topic: "B".into(), question: "q1".into() },
            FaqEntry { topic: "A".into(), question: "q2".into() },
            FaqEntry { topic: "B".into(), question: "q3".into() },
        ];
        assert_eq!(distinct_topics(&entries), vec!["B", "A"]);
    }

    // --- chat handler ---

    fn test_state(endpoint: &str) -> AppState {
        let llm = LlmClient::new(LlmConfig {
            endpoint: endpoint.to_string(),
            model: "deepseek-v3".to_string(),
            api_key: "test-key".to_string(),
        })
        .unwrap();
        AppState {
            router: TopicRouter { llm: llm.clone() },
            manager: BdManager { llm },
            topics: Arc::new(vec!["Contract Law".to_string()]),
        }
    }

    #[tokio::test]
    async fn empty_message_fails_fast() {
        // nothing listens on port 9; the handler must not get that far
        let state = test_state("http://127.0.0.1:9");
        let Json(reply) = chat(State(state), Json(ChatRequest { message: String::new() })).await;
        assert_eq!(
            serde_json::to_string(&reply).unwrap(),
            r#"{"error":"No message provided"}"#
        );
    }

    #[tokio::test]
    async fn upstream_failure_maps_to_generic_error() {
        let state = test_state("http://127.0.0.1:9");
        let Json(reply) = chat(State(state), Json(ChatRequest { message: "hello".into() })).await;
        assert_eq!(
            serde_json::to_string(&reply).unwrap(),
            r#"{"error":"Unable to connect to chat service. Please try again later."}"#
        );
    }

    #[test]
    fn reply_serializes_exactly_one_key() {
        let ok = serde_json::to_string(&ChatReply::Success { response: "<p>hi</p>".into() }).unwrap();
        assert_eq!(ok, r#"{"response":"<p>hi</p>"}"#);
    }
}
