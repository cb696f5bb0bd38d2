//! Per-request chat session.
//!
//! One session multiplexes a single downstream chunked response against a
//! sequence of upstream chat turns. The upstream-reader task watches the
//! model's text through the keyword detector; detected tool calls are
//! executed and fed back to the model as synthetic user turns, everything
//! else flows to the downstream frame queue. The HTTP layer drains that
//! queue through [`ChatSession::into_response_stream`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use toolgate_core::detector::{ToolCallDetector, Verdict};
use toolgate_core::frame::{assistant_frame, replace_text, TurnStatus};
use toolgate_core::heartbeat::Heartbeat;
use toolgate_core::queue::{FrameQueue, PushError};
use toolgate_core::runner::TaskRunner;
use toolgate_core::tools::{
    LoopDetector, ToolRegistry, ToolVerdict, LOOP_GUARD_REPLY, UNKNOWN_TOOL_REPLY,
};
use toolgate_core::ProxyError;

use crate::upstream::Upstream;

/// How often the downstream drainer re-checks an empty queue.
const DRAIN_POLL: Duration = Duration::from_millis(50);
/// Backpressure tick when the frame queue is full.
const PUSH_RETRY: Duration = Duration::from_millis(250);
/// Gives the downstream writer a chance to flush a final user reply.
const USER_REPLY_FLUSH: Duration = Duration::from_millis(150);

pub struct ChatSession {
    queue: Arc<FrameQueue>,
    cancel: CancellationToken,
    reader: Option<TaskRunner>,
}

impl ChatSession {
    /// Validates the parsed client request, injects the tool preamble and
    /// starts the upstream-reader task. The session's cancel token is a
    /// child of `parent`, so process shutdown reaches every request.
    pub fn start(
        mut client_json: Value,
        registry: Arc<ToolRegistry>,
        upstream: Arc<dyn Upstream>,
        parent: &CancellationToken,
    ) -> Result<Self, ProxyError> {
        match client_json.get("stream") {
            None => {
                return Err(ProxyError::InvalidClientRequest(
                    "Expected 'stream' field to be present.".to_string(),
                ))
            }
            Some(Value::Bool(true)) => {}
            Some(Value::Bool(false)) => {
                return Err(ProxyError::InvalidClientRequest(
                    "Expected 'stream' field to be true.".to_string(),
                ))
            }
            Some(_) => {
                return Err(ProxyError::InvalidClientRequest(
                    "Expected 'stream' field to be a boolean.".to_string(),
                ))
            }
        }

        insert_tool_preamble(&mut client_json, &registry)?;
        debug!("chat session accepted: {client_json}");

        let queue = Arc::new(FrameQueue::default());
        let cancel = parent.child_token();
        let reader = TaskRunner::spawn(cancel.clone(), {
            let queue = queue.clone();
            move |token| reader_loop(upstream, registry, client_json, queue, token)
        });

        Ok(Self {
            queue,
            cancel,
            reader: Some(reader),
        })
    }

    /// Turns the session into the chunked response body: one yielded item
    /// per frame, so hyper frames each one as its own HTTP chunk. The
    /// stream never waits for frames that are not ready yet beyond a short
    /// poll tick, and dropping it (client disconnect) trips the session's
    /// cancel token.
    pub fn into_response_stream(mut self) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        let queue = self.queue.clone();
        let cancel = self.cancel.clone();
        let reader = self.reader.take();
        let guard = DisconnectGuard {
            cancel: cancel.clone(),
        };

        async_stream::stream! {
            let _guard = guard;
            loop {
                let frames = queue.drain_ready();
                if frames.is_empty() {
                    if queue.is_closed() || cancel.is_cancelled() {
                        break;
                    }
                    tokio::time::sleep(DRAIN_POLL).await;
                    continue;
                }
                for frame in frames {
                    yield Ok(Bytes::from(frame));
                }
            }
            // Orderly end: reader joined before the response closes.
            if let Some(reader) = reader {
                reader.stop_and_join().await;
            }
            queue.clear();
        }
    }
}

/// Trips the request's cancel token when the response body is dropped, so a
/// vanished client stops the upstream reader within its next suspend point.
struct DisconnectGuard {
    cancel: CancellationToken,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Injects the system preamble that teaches the model which keywords invoke
/// backend tools. Placed right after the first run of leading system
/// messages ends; at the front when the conversation opens with none.
fn insert_tool_preamble(client_json: &mut Value, registry: &ToolRegistry) -> Result<(), ProxyError> {
    if registry.is_empty() {
        return Ok(());
    }
    let messages = client_json
        .get_mut("messages")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| {
            ProxyError::InvalidClientRequest("Expected 'messages' to be an array.".to_string())
        })?;

    let role_of = |message: &Value| {
        message
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };
    let mut insert_at = 0;
    for i in 0..messages.len().saturating_sub(1) {
        if role_of(&messages[i]) == "system" && role_of(&messages[i + 1]) != "system" {
            insert_at = i + 1;
            break;
        }
    }

    let mut body = String::from(
        "There is (are) backend keyword(s) below you can you to access real world.\n\
         Put keyword as first word in reply to receive real world information\n\
         Prepend keyword with any words or symbols to send it to user.\n\n\n",
    );
    for keyword in registry.keywords() {
        if let Some(command) = registry.get(&keyword) {
            body.push_str(&command.instruction_text());
            body.push_str("\n\n");
        }
    }
    body.push_str("List of keywords is ended.\n\n");

    messages.insert(insert_at, json!({ "role": "system", "content": body }));
    Ok(())
}

/// Builds the follow-up upstream request carrying a tool result: the
/// original client request plus one appended user message.
fn request_with_tool_result(original: &Value, mut payload: String) -> Value {
    let mut next = original.clone();
    payload.push('\n');
    if let Some(messages) = next.get_mut("messages").and_then(Value::as_array_mut) {
        messages.push(json!({ "role": "user", "content": payload }));
    }
    next
}

/// Pushes one serialized frame, waiting out a full queue cooperatively.
/// `false` once the downstream side is gone.
async fn push_frame(queue: &FrameQueue, token: &CancellationToken, frame: String) -> bool {
    let mut frame = frame;
    loop {
        match queue.try_push(frame) {
            Ok(()) => return true,
            Err(PushError::Closed) => return false,
            Err(PushError::Full(back)) => {
                frame = back;
                tokio::select! {
                    _ = token.cancelled() => return false,
                    _ = tokio::time::sleep(PUSH_RETRY) => {}
                }
            }
        }
    }
}

async fn push_value(queue: &FrameQueue, token: &CancellationToken, frame: Value) -> bool {
    push_frame(queue, token, frame.to_string()).await
}

/// The upstream-reader task: runs the whole multi-turn conversation for one
/// downstream request and closes the queue when the conversation is over.
async fn reader_loop(
    upstream: Arc<dyn Upstream>,
    registry: Arc<ToolRegistry>,
    original: Value,
    queue: Arc<FrameQueue>,
    token: CancellationToken,
) {
    let model = original
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let mut detector = ToolCallDetector::new(registry.clone());
    let mut heartbeat = Heartbeat::new();
    let mut loop_guard = LoopDetector::new();
    let mut pending = Some(original.clone());

    'conversation: while let Some(request) = pending.take() {
        if token.is_cancelled() || queue.is_closed() {
            break;
        }
        heartbeat.start(&model);
        let mut turn = upstream.chat(request);
        let mut detection: Option<(String, String)> = None;

        loop {
            let item = tokio::select! {
                _ = token.cancelled() => break 'conversation,
                item = turn.next() => item,
            };
            let frame = match item {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    warn!("upstream turn failed: {err}");
                    break 'conversation;
                }
                // Upstream closed the turn without a terminal frame.
                None => break 'conversation,
            };

            debug!("upstream frame: {frame}");
            let (status, verdict) = detector.update(&frame);
            match verdict {
                Verdict::AlreadyDelivered => {
                    if status == TurnStatus::CommunicationFailure {
                        warn!(
                            "upstream frame without boolean 'done', stopping: {frame}"
                        );
                        break 'conversation;
                    }
                    // Turn already classified as prose: forward verbatim.
                    if !push_value(&queue, &token, frame.clone()).await {
                        break 'conversation;
                    }
                    if status == TurnStatus::UpstreamSentAll {
                        break 'conversation;
                    }
                }
                Verdict::NeedMoreData(collected) => {
                    if status == TurnStatus::UpstreamSentAll {
                        // Turn ended while detection was still pending:
                        // flush whatever was withheld.
                        if let Some(terminator) = heartbeat.finish() {
                            push_value(&queue, &token, terminator).await;
                        }
                        push_value(&queue, &token, replace_text(&frame, collected)).await;
                        break 'conversation;
                    }
                    // Accumulate silently.
                }
                Verdict::PassToUser(text) => {
                    if let Some(terminator) = heartbeat.finish() {
                        push_value(&queue, &token, terminator).await;
                    }
                    if !push_value(&queue, &token, replace_text(&frame, text)).await {
                        break 'conversation;
                    }
                    if status == TurnStatus::UpstreamSentAll {
                        break 'conversation;
                    }
                }
                Verdict::Detected { keyword, text } => {
                    debug!("model invoked tool {keyword}");
                    detection = Some((keyword, text));
                    break;
                }
            }
        }

        let Some((keyword, collected)) = detection else {
            break;
        };

        // Tool execution phase.
        let verdict = match registry.get(&keyword) {
            Some(_) => {
                if let Some(ping) = heartbeat.ping() {
                    push_value(&queue, &token, ping).await;
                }
                match registry.classify(&keyword, collected) {
                    Some(verdict) => verdict,
                    // Handler panicked; the request dies, the process lives.
                    None => {
                        error!("tool {keyword} failed, dropping the request");
                        break;
                    }
                }
            }
            None => {
                error!("detected keyword {keyword} is not registered");
                ToolVerdict::WasToolRequest(UNKNOWN_TOOL_REPLY.to_string())
            }
        };

        match verdict {
            ToolVerdict::WasUserReply(text) => {
                loop_guard.reset();
                if let Some(terminator) = heartbeat.finish() {
                    push_value(&queue, &token, terminator).await;
                }
                push_value(&queue, &token, assistant_frame(&model, text)).await;
                // One user reply ends the request; let the writer catch up.
                tokio::time::sleep(USER_REPLY_FLUSH).await;
            }
            ToolVerdict::WasToolRequest(text) | ToolVerdict::MaybeUserReply(text) => {
                loop_guard.update(&keyword);
                let payload = if loop_guard.is_looping() {
                    warn!("loop guard tripped for {keyword}");
                    LOOP_GUARD_REPLY.to_string()
                } else {
                    text
                };
                pending = Some(request_with_tool_result(&original, payload));
                detector.reset();
                if let Some(terminator) = heartbeat.finish() {
                    push_value(&queue, &token, terminator).await;
                }
            }
        }
    }

    if let Some(terminator) = heartbeat.finish() {
        push_value(&queue, &token, terminator).await;
    }
    queue.close();
    token.cancel();
    debug!("upstream reader finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::TurnStream;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use toolgate_core::frame::content_of;
    use toolgate_core::tools::{keyword_only, ToolCommand};

    /// Plays back pre-scripted turns and records every request it was
    /// given. Turns beyond the script are empty streams.
    struct ScriptedUpstream {
        turns: Mutex<VecDeque<Vec<Value>>>,
        requests: Mutex<Vec<Value>>,
    }

    impl ScriptedUpstream {
        fn new(turns: Vec<Vec<Value>>) -> Self {
            Self {
                turns: Mutex::new(turns.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<Value> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Upstream for ScriptedUpstream {
        fn chat(&self, request: Value) -> TurnStream {
            self.requests.lock().unwrap().push(request);
            let frames = self.turns.lock().unwrap().pop_front().unwrap_or_default();
            Box::pin(futures::stream::iter(
                frames.into_iter().map(Ok::<Value, ProxyError>),
            ))
        }
    }

    fn chunk(content: &str, done: bool) -> Value {
        json!({
            "created_at": "2025-04-26T12:13:59.246926Z",
            "done": done,
            "model": "m",
            "message": { "role": "assistant", "content": content },
        })
    }

    fn chat_request(messages: Value) -> Value {
        json!({ "model": "m", "stream": true, "messages": messages })
    }

    async fn collect(session: ChatSession) -> Vec<Value> {
        let mut stream = Box::pin(session.into_response_stream());
        let mut frames = Vec::new();
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(item) = stream.next().await {
                frames.push(serde_json::from_slice::<Value>(&item.unwrap()).unwrap());
            }
        })
        .await;
        drained.expect("response stream should close");
        frames
    }

    #[tokio::test]
    async fn empty_registry_forwards_frames_verbatim() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![vec![
            chunk("Hello", false),
            chunk(" world", true),
        ]]));
        let session = ChatSession::start(
            chat_request(json!([{"role": "user", "content": "hi"}])),
            Arc::new(ToolRegistry::empty()),
            upstream.clone(),
            &CancellationToken::new(),
        )
        .unwrap();

        let frames = collect(session).await;
        assert_eq!(frames, vec![chunk("Hello", false), chunk(" world", true)]);

        let requests = upstream.requests();
        assert_eq!(requests.len(), 1);
        // No tools, no preamble: the client's messages go through untouched.
        assert_eq!(
            requests[0]["messages"],
            json!([{"role": "user", "content": "hi"}])
        );
    }

    #[tokio::test]
    async fn tool_invocation_round_trip() {
        let registry = Arc::new(
            ToolRegistry::new([ToolCommand::new(
                "AI_DATE_TIME_NOW",
                "Respond with single word ${KEYWORD} to get the time.",
                keyword_only(|_| "2025-04-25T16:10:00+03:00".to_string()),
            )
            .unwrap()])
            .unwrap(),
        );
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            vec![chunk("AI_DATE_TIME_NOW", true)],
            vec![chunk("It's 16:10.", true)],
        ]));
        let session = ChatSession::start(
            chat_request(json!([{"role": "user", "content": "what time is it?"}])),
            registry,
            upstream.clone(),
            &CancellationToken::new(),
        )
        .unwrap();

        let frames = collect(session).await;
        let contents: Vec<&str> = frames.iter().map(content_of).collect();
        assert_eq!(contents, vec!["Working.", ".\n\n", "It's 16:10."]);
        // The keyword turn itself never reaches the client.
        assert!(frames
            .iter()
            .all(|frame| !frame.to_string().contains("AI_DATE_TIME_NOW")));

        let requests = upstream.requests();
        assert_eq!(requests.len(), 2);
        let followup = requests[1]["messages"].as_array().unwrap();
        assert_eq!(
            followup.last().unwrap(),
            &json!({"role": "user", "content": "2025-04-25T16:10:00+03:00\n"})
        );
        // The follow-up is the original request plus exactly one message.
        assert_eq!(
            followup.len(),
            requests[0]["messages"].as_array().unwrap().len() + 1
        );
    }

    #[tokio::test]
    async fn keyword_opening_a_real_reply_is_forwarded() {
        let registry = Arc::new(
            ToolRegistry::new([ToolCommand::new(
                "AI_NOW",
                "test",
                keyword_only(|_| "unused".to_string()),
            )
            .unwrap()])
            .unwrap(),
        );
        let upstream = Arc::new(ScriptedUpstream::new(vec![vec![chunk(
            "AI_NOW is a keyword I can use",
            true,
        )]]));
        let session = ChatSession::start(
            chat_request(json!([{"role": "user", "content": "hi"}])),
            registry,
            upstream.clone(),
            &CancellationToken::new(),
        )
        .unwrap();

        let frames = collect(session).await;
        let contents: Vec<&str> = frames.iter().map(content_of).collect();
        assert_eq!(
            contents,
            vec!["Working.", ".\n\n", "AI_NOW is a keyword I can use"]
        );
        // A user reply ends the request; no follow-up turn is launched.
        assert_eq!(upstream.requests().len(), 1);
    }

    #[tokio::test]
    async fn loop_guard_replaces_third_identical_result() {
        let registry = Arc::new(
            ToolRegistry::new([ToolCommand::new(
                "AI_MORE",
                "test",
                Arc::new(|_: &str, _| ToolVerdict::WasToolRequest("same".to_string())),
            )
            .unwrap()])
            .unwrap(),
        );
        let turns = (0..4).map(|_| vec![chunk("AI_MORE", true)]).collect();
        let upstream = Arc::new(ScriptedUpstream::new(turns));
        let session = ChatSession::start(
            chat_request(json!([{"role": "user", "content": "go"}])),
            registry,
            upstream.clone(),
            &CancellationToken::new(),
        )
        .unwrap();

        collect(session).await;

        let requests = upstream.requests();
        let injected: Vec<String> = requests[1..]
            .iter()
            .map(|request| {
                request["messages"]
                    .as_array()
                    .unwrap()
                    .last()
                    .unwrap()["content"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(injected[0], "same\n");
        assert_eq!(injected[1], "same\n");
        assert_eq!(injected[2], format!("{LOOP_GUARD_REPLY}\n"));
    }

    #[tokio::test]
    async fn unparseable_done_field_ends_the_response() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![vec![
            chunk("Hel", false),
            json!({"model": "m", "message": {"content": "lo"}}),
            chunk("never seen", true),
        ]]));
        let session = ChatSession::start(
            chat_request(json!([{"role": "user", "content": "hi"}])),
            Arc::new(ToolRegistry::empty()),
            upstream,
            &CancellationToken::new(),
        )
        .unwrap();

        let frames = collect(session).await;
        // Only the frame before the broken one made it through.
        assert_eq!(frames.len(), 1);
        assert_eq!(content_of(&frames[0]), "Hel");
    }

    struct HangingUpstream {
        started: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
    }

    impl HangingUpstream {
        fn new() -> Self {
            Self {
                started: Arc::new(AtomicBool::new(false)),
                dropped: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl Upstream for HangingUpstream {
        fn chat(&self, _request: Value) -> TurnStream {
            self.started.store(true, Ordering::SeqCst);
            // Created here, not inside the stream body, so dropping the
            // stream is observable even if it was never polled.
            let guard = SetOnDrop(self.dropped.clone());
            Box::pin(async_stream::stream! {
                let _guard = guard;
                yield Ok::<Value, ProxyError>(json!({
                    "done": false,
                    "model": "m",
                    "message": {"role": "assistant", "content": "partial"},
                }));
                futures::future::pending::<()>().await;
            })
        }
    }

    async fn wait_for(flag: &AtomicBool) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !flag.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("flag should flip within a second");
    }

    #[tokio::test]
    async fn client_disconnect_stops_the_upstream_reader() {
        let upstream = Arc::new(HangingUpstream::new());
        let dropped = upstream.dropped.clone();
        let session = ChatSession::start(
            chat_request(json!([{"role": "user", "content": "hi"}])),
            Arc::new(ToolRegistry::empty()),
            upstream,
            &CancellationToken::new(),
        )
        .unwrap();

        let mut stream = Box::pin(session.into_response_stream());
        let first = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("first frame should arrive");
        assert!(first.is_some());

        // Client goes away mid-turn.
        drop(stream);

        wait_for(&dropped).await;
    }

    #[tokio::test]
    async fn process_shutdown_reaches_the_session() {
        let upstream = Arc::new(HangingUpstream::new());
        let started = upstream.started.clone();
        let dropped = upstream.dropped.clone();
        let root = CancellationToken::new();
        let session = ChatSession::start(
            chat_request(json!([{"role": "user", "content": "hi"}])),
            Arc::new(ToolRegistry::empty()),
            upstream,
            &root,
        )
        .unwrap();

        let collector = tokio::spawn(collect(session));
        wait_for(&started).await;
        root.cancel();
        tokio::time::timeout(Duration::from_secs(2), collector)
            .await
            .expect("drainer should close on shutdown")
            .unwrap();
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn preamble_goes_after_leading_system_block() {
        let registry =
            ToolRegistry::new([ToolCommand::new("AI_NOW", "Use ${KEYWORD}.", keyword_only(|_| String::new())).unwrap()])
                .unwrap();
        let mut request = chat_request(json!([
            {"role": "system", "content": "a"},
            {"role": "system", "content": "b"},
            {"role": "user", "content": "hi"},
        ]));
        insert_tool_preamble(&mut request, &registry).unwrap();

        let messages = request["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2]["role"], json!("system"));
        let preamble = messages[2]["content"].as_str().unwrap();
        assert!(preamble.starts_with("There is (are) backend keyword(s)"));
        assert!(preamble.contains("Use AI_NOW."));
        assert!(preamble.ends_with("List of keywords is ended.\n\n"));
    }

    #[test]
    fn preamble_goes_first_without_system_messages() {
        let registry =
            ToolRegistry::new([ToolCommand::new("AI_NOW", "x", keyword_only(|_| String::new())).unwrap()])
                .unwrap();
        let mut request = chat_request(json!([{"role": "user", "content": "hi"}]));
        insert_tool_preamble(&mut request, &registry).unwrap();

        let messages = request["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], json!("system"));
        assert_eq!(messages[1]["role"], json!("user"));
    }

    #[test]
    fn preamble_requires_a_messages_array() {
        let registry =
            ToolRegistry::new([ToolCommand::new("AI_NOW", "x", keyword_only(|_| String::new())).unwrap()])
                .unwrap();
        let mut request = json!({"model": "m", "stream": true});
        assert!(insert_tool_preamble(&mut request, &registry).is_err());
    }

    #[test]
    fn empty_registry_skips_the_preamble() {
        let mut request = chat_request(json!([{"role": "user", "content": "hi"}]));
        insert_tool_preamble(&mut request, &ToolRegistry::empty()).unwrap();
        assert_eq!(request["messages"].as_array().unwrap().len(), 1);
    }
}
