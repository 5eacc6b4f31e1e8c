//! One query run: arguments in, exactly one [`InvocationResult`] out.

use crate::host::ScriptHost;
use crate::protocol::{events, BridgeError};
use async_trait::async_trait;
use lxbridge_core::{InvocationResult, Query};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Message used when the handler produced nothing usable.
pub const NO_RESULT: &str = "no result";

/// What the orchestrator needs from a script runtime.
#[async_trait(?Send)]
pub trait PluginHost {
    /// Execute the script so it can register its handlers.
    fn load(&mut self, script: &Path) -> Result<(), BridgeError>;

    /// Invoke the handler for `event` and wait for its settled value.
    async fn dispatch(&mut self, event: &str, payload: &Value) -> Result<Value, BridgeError>;
}

#[async_trait(?Send)]
impl PluginHost for ScriptHost {
    fn load(&mut self, script: &Path) -> Result<(), BridgeError> {
        ScriptHost::load(self, script)
    }

    async fn dispatch(&mut self, event: &str, payload: &Value) -> Result<Value, BridgeError> {
        ScriptHost::dispatch(self, event, payload).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Upper bound on the `request` dispatch. `None` waits for as long as work remains.
    pub timeout: Option<Duration>,
}

/// Split the positional arguments into the script path and the query.
///
/// Returns `None` when fewer than five are given; extras are ignored.
pub fn parse_args(args: &[String]) -> Option<(PathBuf, Query)> {
    match args {
        [script, source, song_id, quality, info, ..] => Some((
            PathBuf::from(script),
            Query::new(source.as_str(), song_id.as_str(), quality.as_str(), info),
        )),
        _ => None,
    }
}

/// Run one lookup end to end. Never fails: every error becomes a result.
pub async fn run_query<H, F>(args: &[String], options: &RunOptions, make_host: F) -> InvocationResult
where
    H: PluginHost,
    F: FnOnce() -> Result<H, BridgeError>,
{
    let Some((script, query)) = parse_args(args) else {
        tracing::warn!(given = args.len(), "expected 5 positional arguments");
        return InvocationResult::InvalidInput;
    };

    match lookup(&script, &query, options, make_host).await {
        Ok(value) if is_truthy(&value) => InvocationResult::Success(value),
        Ok(_) => InvocationResult::failure(NO_RESULT),
        Err(err) => {
            tracing::debug!(kind = ?err.kind(), error = %err, "query failed");
            InvocationResult::failure(err.to_string())
        }
    }
}

async fn lookup<H, F>(
    script: &Path,
    query: &Query,
    options: &RunOptions,
    make_host: F,
) -> Result<Value, BridgeError>
where
    H: PluginHost,
    F: FnOnce() -> Result<H, BridgeError>,
{
    let mut host = make_host()?;
    host.load(script)?;

    let payload = serde_json::to_value(query.payload())?;
    tracing::info!(
        source = %query.source,
        song_id = %query.song_id,
        quality = %query.quality,
        "dispatching request"
    );

    let dispatch = host.dispatch(events::REQUEST, &payload);
    match options.timeout {
        Some(limit) => tokio::time::timeout(limit, dispatch)
            .await
            .map_err(|_| BridgeError::Timeout(limit))?,
        None => dispatch.await,
    }
}

/// JS truthiness for the values a handler can hand back.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records what the orchestrator asked for and answers with a canned outcome.
    #[derive(Default)]
    struct Calls {
        loads: usize,
        dispatched: Vec<(String, Value)>,
    }

    enum Answer {
        Value(Value),
        Reject(&'static str),
        FailLoad(&'static str),
        Hang,
    }

    struct ProbeHost {
        calls: Rc<RefCell<Calls>>,
        answer: Answer,
    }

    #[async_trait(?Send)]
    impl PluginHost for ProbeHost {
        fn load(&mut self, _script: &Path) -> Result<(), BridgeError> {
            self.calls.borrow_mut().loads += 1;
            match self.answer {
                Answer::FailLoad(message) => Err(BridgeError::Load(message.to_string())),
                _ => Ok(()),
            }
        }

        async fn dispatch(&mut self, event: &str, payload: &Value) -> Result<Value, BridgeError> {
            self.calls
                .borrow_mut()
                .dispatched
                .push((event.to_string(), payload.clone()));
            match &self.answer {
                Answer::Value(value) => Ok(value.clone()),
                Answer::Reject(message) => Err(BridgeError::Rejected(message.to_string())),
                Answer::FailLoad(_) => unreachable!("dispatch after failed load"),
                Answer::Hang => std::future::pending().await,
            }
        }
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn full_args(info: &str) -> Vec<String> {
        args(&["./source.js", "kw", "123", "320k", info])
    }

    async fn run(
        argv: &[String],
        options: &RunOptions,
        answer: Answer,
    ) -> (InvocationResult, Rc<RefCell<Calls>>) {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let probe_calls = Rc::clone(&calls);
        let result = run_query(argv, options, move || {
            Ok(ProbeHost {
                calls: probe_calls,
                answer,
            })
        })
        .await;
        (result, calls)
    }

    #[tokio::test]
    async fn too_few_arguments_is_invalid_input_without_loading() {
        for count in 0..5 {
            let argv = full_args("{}")[..count].to_vec();
            let (result, calls) = run(&argv, &RunOptions::default(), Answer::Value(json!(1))).await;
            assert_eq!(result, InvocationResult::InvalidInput);
            assert_eq!(calls.borrow().loads, 0);
        }
    }

    #[tokio::test]
    async fn host_construction_failure_becomes_failure() {
        let result = run_query(&full_args("{}"), &RunOptions::default(), || {
            Err::<ProbeHost, _>(BridgeError::Engine("out of memory".into()))
        })
        .await;
        assert_eq!(
            result,
            InvocationResult::failure("script engine error: out of memory")
        );
    }

    #[tokio::test]
    async fn request_payload_is_built_from_arguments() {
        let (result, calls) = run(
            &full_args(r#"{"name":"Song","songmid":"override"}"#),
            &RunOptions::default(),
            Answer::Value(json!("https://example.com/song.mp3")),
        )
        .await;

        assert_eq!(
            result,
            InvocationResult::Success(json!("https://example.com/song.mp3"))
        );
        let calls = calls.borrow();
        assert_eq!(calls.loads, 1);
        assert_eq!(
            calls.dispatched,
            vec![(
                "request".to_string(),
                json!({
                    "action": "musicUrl",
                    "source": "kw",
                    "info": {
                        "musicInfo": { "songmid": "override", "hash": "123", "name": "Song" },
                        "type": "320k"
                    }
                })
            )]
        );
    }

    #[tokio::test]
    async fn malformed_info_and_extra_arguments_are_tolerated() {
        let mut argv = full_args("{not json");
        argv.push("ignored".into());
        let (result, calls) =
            run(&argv, &RunOptions::default(), Answer::Value(json!("u"))).await;

        assert_eq!(result, InvocationResult::Success(json!("u")));
        assert_eq!(
            calls.borrow().dispatched[0].1["info"]["musicInfo"],
            json!({ "songmid": "123", "hash": "123" })
        );
    }

    #[tokio::test]
    async fn falsy_values_are_no_result() {
        for value in [json!(null), json!(false), json!(0), json!(0.0), json!("")] {
            let (result, _) = run(
                &full_args("{}"),
                &RunOptions::default(),
                Answer::Value(value.clone()),
            )
            .await;
            assert_eq!(result, InvocationResult::failure(NO_RESULT), "value {value}");
        }
    }

    #[tokio::test]
    async fn truthy_structures_are_passed_through() {
        let data = json!({ "url": "https://a/b.flac", "type": "flac" });
        let (result, _) = run(
            &full_args("{}"),
            &RunOptions::default(),
            Answer::Value(data.clone()),
        )
        .await;
        assert_eq!(result, InvocationResult::Success(data));
    }

    #[tokio::test]
    async fn rejection_message_is_reported() {
        let (result, _) = run(
            &full_args("{}"),
            &RunOptions::default(),
            Answer::Reject("rate limited"),
        )
        .await;
        assert_eq!(result.to_line(), r#"{"code":2,"msg":"rate limited"}"#);
    }

    #[tokio::test]
    async fn load_failure_skips_dispatch() {
        let (result, calls) = run(
            &full_args("{}"),
            &RunOptions::default(),
            Answer::FailLoad("Unexpected token"),
        )
        .await;
        assert_eq!(
            result,
            InvocationResult::failure("require script error: Unexpected token")
        );
        assert!(calls.borrow().dispatched.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_timeout_is_reported() {
        let options = RunOptions {
            timeout: Some(Duration::from_secs(15)),
        };
        let (result, _) = run(&full_args("{}"), &options, Answer::Hang).await;
        assert_eq!(
            result,
            InvocationResult::failure("plugin timed out after 15s")
        );
    }

    #[test]
    fn parse_args_keeps_raw_script_path() {
        let (script, query) = parse_args(&full_args("")).unwrap();
        assert_eq!(script, PathBuf::from("./source.js"));
        assert_eq!(query.source, "kw");
        assert_eq!(query.song_id, "123");
        assert_eq!(query.quality, "320k");
        assert!(query.extra_info.is_empty());
    }
}
