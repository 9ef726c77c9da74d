//! OpenAI-compatible chat completions client.
//!
//! Requests go to `POST <base>/v1/chat/completions`. A single output streams
//! over SSE so text can reach the screen as it is generated; multiple
//! outputs (`n_outputs > 1`) use one non-streaming request with the API `n`
//! parameter. The request body is the merge of the program's
//! `completion_args` and the task's own fields (interpreter-internal keys
//! removed), with `extra_body` flattened into the top level.

use eventsource_stream::Eventsource;
use futures::StreamExt;
use skein_types::{value_to_json, Error, Result, ValueMap};

use crate::filter::{InvertedFilter, OutputFilter};

/// Everything a chat call needs, already merged and interpolated.
#[derive(Debug, Clone)]
pub struct ChatArgs {
    /// `(role, content)` pairs.
    pub messages: Vec<(String, String)>,
    /// Body seed: merged completion arguments minus the control fields below.
    pub completion_args: ValueMap,
    /// Marker pair extracting the stored output from the raw response.
    pub start_str: String,
    pub stop_str: String,
    /// Marker pair hiding spans from the visual output.
    pub hide_start_str: String,
    pub hide_stop_str: String,
    pub n_outputs: i64,
    /// Whether generated text goes to the screen at all.
    pub shown: bool,
    /// Extra fields flattened into the top-level request body.
    pub extra_body: ValueMap,
    pub api_url: String,
    pub api_key: String,
}

impl Default for ChatArgs {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            completion_args: ValueMap::new(),
            start_str: String::new(),
            stop_str: String::new(),
            hide_start_str: String::new(),
            hide_stop_str: String::new(),
            n_outputs: 1,
            shown: true,
            extra_body: ValueMap::new(),
            api_url: DEFAULT_API_URL.to_string(),
            api_key: DEFAULT_API_KEY.to_string(),
        }
    }
}

pub const DEFAULT_API_URL: &str = "http://localhost:8080";
pub const DEFAULT_API_KEY: &str = "unused";

#[derive(Debug)]
pub struct ChatResult {
    /// The extracted outputs (one per start/stop pair, or the whole text).
    pub outputs: Vec<String>,
    /// What was (or would be) shown on screen.
    pub visual_output: String,
    /// The unfiltered assistant text.
    pub raw: String,
}

/// Run one chat request. `on_text` receives visible fragments as they
/// arrive (streaming) or once (multi-output).
///
/// The caller owns retry policy: a short multi-output response comes back
/// as-is with fewer than `n_outputs` entries.
pub async fn run_chat(
    args: &ChatArgs,
    mut on_text: Option<&mut (dyn FnMut(&str) + Send)>,
) -> Result<ChatResult> {
    if args.start_str.is_empty() != args.stop_str.is_empty() {
        return Err(Error::Type(
            "set both start_str and stop_str, or neither".into(),
        ));
    }

    let streaming = args.n_outputs <= 1;
    let body = build_request_body(args, streaming);
    let url = normalize_api_url(&args.api_url);
    let client = reqwest::Client::new();
    let response = client
        .post(url)
        .bearer_auth(&args.api_key)
        .json(&serde_json::Value::Object(body))
        .send()
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Transport(format!(
            "chat request failed: {status} {body}"
        )));
    }

    if streaming {
        stream_single_output(args, response, &mut on_text).await
    } else {
        collect_outputs(args, response, &mut on_text).await
    }
}

async fn stream_single_output(
    args: &ChatArgs,
    response: reqwest::Response,
    on_text: &mut Option<&mut (dyn FnMut(&str) + Send)>,
) -> Result<ChatResult> {
    let mut output_filter = OutputFilter::new(&args.start_str, &args.stop_str, false);
    let mut hide_filter = InvertedFilter::new(&args.hide_start_str, &args.hide_stop_str);
    let mut raw = String::new();
    let mut visual_output = String::new();
    let mut ran_out_of_context = false;

    let mut stream = response.bytes_stream().eventsource();
    while let Some(event) = stream.next().await {
        let event = event.map_err(|e| Error::Transport(e.to_string()))?;
        if event.data == "[DONE]" {
            break;
        }
        let chunk: serde_json::Value =
            serde_json::from_str(&event.data).map_err(|e| Error::Transport(e.to_string()))?;
        let choice = chunk
            .get("choices")
            .and_then(serde_json::Value::as_array)
            .and_then(|arr| arr.first());
        let delta = choice
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("");
        let finish_reason = choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(serde_json::Value::as_str);
        if finish_reason == Some("length") {
            ran_out_of_context = true;
        }
        if !delta.is_empty() {
            raw.push_str(delta);
            let fragment = output_filter.update(delta);
            let visual_fragment = hide_filter.update(&fragment);
            if args.shown && !visual_fragment.is_empty() {
                if let Some(cb) = on_text.as_mut() {
                    cb(&visual_fragment);
                }
                visual_output.push_str(&visual_fragment);
            }
        }
    }

    if ran_out_of_context {
        return Err(Error::Transport("generation exceeded context length".into()));
    }

    let outputs = output_filter
        .outputs()
        .into_iter()
        .map(|o| o.trim().to_string())
        .collect();
    Ok(ChatResult {
        outputs,
        visual_output,
        raw,
    })
}

async fn collect_outputs(
    args: &ChatArgs,
    response: reqwest::Response,
    on_text: &mut Option<&mut (dyn FnMut(&str) + Send)>,
) -> Result<ChatResult> {
    let json: serde_json::Value = response
        .json()
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    let choices = json
        .get("choices")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| Error::Transport("chat response has no choices".into()))?;

    let mut raw = String::new();
    let mut outputs = Vec::new();
    for choice in choices {
        if choice.get("finish_reason").and_then(serde_json::Value::as_str) == Some("length") {
            return Err(Error::Transport("generation exceeded context length".into()));
        }
        let content = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("");
        if !raw.is_empty() {
            raw.push('\n');
        }
        raw.push_str(content);
        if args.start_str.is_empty() {
            outputs.push(content.trim().to_string());
        } else {
            outputs.extend(
                OutputFilter::extract(&args.start_str, &args.stop_str, content)
                    .into_iter()
                    .map(|o| o.trim().to_string()),
            );
        }
    }

    let mut visual_output = String::new();
    if args.shown {
        let mut hide_filter = InvertedFilter::new(&args.hide_start_str, &args.hide_stop_str);
        for (i, output) in outputs.iter().enumerate() {
            let block = if i == 0 {
                format!("{}. {output}", i + 1)
            } else {
                format!("\n\n{}. {output}", i + 1)
            };
            visual_output.push_str(&hide_filter.update(&block));
        }
        if let Some(cb) = on_text.as_mut() {
            if !visual_output.is_empty() {
                cb(&visual_output);
            }
        }
    }

    Ok(ChatResult {
        outputs,
        visual_output,
        raw,
    })
}

/// Assemble the request body.
///
/// `extra_body` entries land at the top level; `max_completion_tokens` is
/// renamed to `max_tokens` for older servers.
fn build_request_body(args: &ChatArgs, streaming: bool) -> serde_json::Map<String, serde_json::Value> {
    let mut body = serde_json::Map::new();
    for (k, v) in &args.completion_args {
        body.insert(k.clone(), value_to_json(v));
    }
    for (k, v) in &args.extra_body {
        body.insert(k.clone(), value_to_json(v));
    }
    if let Some(v) = body.remove("max_completion_tokens") {
        body.insert("max_tokens".to_string(), v);
    }
    let messages: Vec<serde_json::Value> = args
        .messages
        .iter()
        .map(|(role, content)| {
            serde_json::json!({ "role": role, "content": content })
        })
        .collect();
    body.insert("messages".to_string(), serde_json::Value::Array(messages));
    body.insert("stream".to_string(), serde_json::Value::Bool(streaming));
    if args.n_outputs > 1 {
        body.insert("n".to_string(), serde_json::Value::Number(args.n_outputs.into()));
    }
    body
}

fn normalize_api_url(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_types::Value;

    #[test]
    fn url_normalization() {
        assert_eq!(
            normalize_api_url("http://localhost:8080"),
            "http://localhost:8080/v1/chat/completions"
        );
        assert_eq!(
            normalize_api_url("http://host/v1/"),
            "http://host/v1/chat/completions"
        );
        assert_eq!(
            normalize_api_url("https://api.example.com/"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn body_merges_and_flattens() {
        let mut args = ChatArgs::default();
        args.completion_args.insert("model".into(), Value::String("m".into()));
        args.completion_args.insert("temperature".into(), Value::Float(0.7));
        args.completion_args
            .insert("max_completion_tokens".into(), Value::Int(128));
        args.extra_body
            .insert("top_k".into(), Value::Int(40));
        args.messages.push(("user".into(), "hi".into()));

        let body = build_request_body(&args, true);
        assert_eq!(body.get("model"), Some(&serde_json::json!("m")));
        // extra_body lands at the top level, not nested.
        assert_eq!(body.get("top_k"), Some(&serde_json::json!(40)));
        assert!(body.get("extra_body").is_none());
        // legacy rename
        assert!(body.get("max_completion_tokens").is_none());
        assert_eq!(body.get("max_tokens"), Some(&serde_json::json!(128)));
        assert_eq!(body.get("stream"), Some(&serde_json::json!(true)));
        assert!(body.get("n").is_none());
        let messages = body.get("messages").unwrap().as_array().unwrap();
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "hi");
    }

    #[test]
    fn multi_output_requests_n_without_streaming() {
        let args = ChatArgs {
            n_outputs: 3,
            ..ChatArgs::default()
        };
        let body = build_request_body(&args, false);
        assert_eq!(body.get("n"), Some(&serde_json::json!(3)));
        assert_eq!(body.get("stream"), Some(&serde_json::json!(false)));
    }

    #[test]
    fn mismatched_markers_are_rejected() {
        let args = ChatArgs {
            start_str: "<out>".into(),
            ..ChatArgs::default()
        };
        let err = futures::executor::block_on(run_chat(&args, None)).unwrap_err();
        assert!(matches!(err, Error::Type(_)));
    }
}
