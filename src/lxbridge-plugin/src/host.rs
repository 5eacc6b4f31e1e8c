//! QuickJS host that gives a source script its `lx` environment.
//!
//! One [`ScriptHost`] is one JS runtime: the native half of `lx` is built
//! here and handed to the prelude, which assembles the globals scripts see.
//! The host then runs a small single-threaded event loop that pumps promise
//! jobs, HTTP completions and timers until the dispatched handler settles.

use crate::buffer::{self, Encoding};
use crate::bus::EventBus;
use crate::protocol::{events, BridgeError, TaskState, ENVIRONMENT_NAME, RUNTIME_VERSION};
use crate::resolve;
use crate::transport::{self, TransportError, TransportRequest, TransportResponse};
use rquickjs::{Context, Ctx, Exception, Function, Object, Persistent, Runtime, Value};
use serde::Deserialize;
use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

const PRELUDE: &str = include_str!("prelude.js");

/// Node clamps out-of-range timer delays to 1ms.
const MAX_TIMER_DELAY_MS: f64 = 2_147_483_647.0;

type JsHandler = Persistent<Value<'static>>;
type RequestOutcome = (i32, Result<TransportResponse, TransportError>);

/// State the native functions share with the host.
#[derive(Default)]
struct HostState {
    bus: RefCell<EventBus<JsHandler>>,
    outgoing: RefCell<Vec<(i32, TransportRequest)>>,
    timers: RefCell<Vec<(i32, Duration)>>,
}

/// `options` as serialized by `lx.request`.
#[derive(Debug, Deserialize)]
struct ScriptRequestOptions {
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<ScriptRequestBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ScriptRequestBody {
    Text(String),
    Binary(String),
}

fn default_method() -> String {
    "GET".to_string()
}

/// A single-use JavaScript runtime hosting one source script.
pub struct ScriptHost {
    state: Rc<HostState>,
    hooks: Persistent<Object<'static>>,
    next_task: Cell<i32>,
    context: Context,
    runtime: Runtime,
}

impl ScriptHost {
    /// Create the runtime and install `lx` (plus the Node-ish globals) into it.
    pub fn new() -> Result<Self, BridgeError> {
        let runtime = Runtime::new().map_err(|e| BridgeError::Engine(e.to_string()))?;
        let context = Context::full(&runtime).map_err(|e| BridgeError::Engine(e.to_string()))?;
        let state = Rc::new(HostState::default());

        let hooks = context.with(|ctx| -> Result<_, BridgeError> {
            let host = build_host_object(&ctx, &state).map_err(|e| engine_error(&ctx, e))?;
            let prelude: Function = ctx.eval(PRELUDE).map_err(|e| engine_error(&ctx, e))?;
            let hooks: Object = prelude.call((host,)).map_err(|e| engine_error(&ctx, e))?;
            Ok(Persistent::save(&ctx, hooks))
        })?;

        Ok(Self {
            state,
            hooks,
            next_task: Cell::new(1),
            context,
            runtime,
        })
    }

    /// Run the script's top level. Anything it throws is a load failure.
    pub fn load(&self, script: &Path) -> Result<(), BridgeError> {
        let path =
            resolve::absolute_script_path(script).map_err(|e| BridgeError::Load(e.to_string()))?;
        tracing::info!(script = %path.display(), "loading source script");

        let failure = self.context.with(|ctx| -> Result<Option<String>, BridgeError> {
            let load = self.hook(&ctx, "load")?;
            load.call((path.to_string_lossy().into_owned(),))
                .map_err(|e| engine_error(&ctx, e))
        })?;

        match failure {
            None => {
                tracing::debug!(
                    handlers = self.state.bus.borrow().len(),
                    "source script loaded"
                );
                Ok(())
            }
            Some(message) => Err(BridgeError::Load(message)),
        }
    }

    /// Whether the script registered a handler for `event`.
    pub fn has_handler(&self, event: &str) -> bool {
        self.state.bus.borrow().is_registered(event)
    }

    /// Invoke the handler registered for `event` and wait for it to settle.
    ///
    /// An unregistered event (or a non-function registration) resolves to
    /// `null` without running any script code.
    pub async fn dispatch(
        &self,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError> {
        let handler = self.state.bus.borrow().handler(event).cloned();
        let Some(handler) = handler else {
            tracing::debug!(event, "no handler registered");
            return Ok(serde_json::Value::Null);
        };

        let task = self.next_task.get();
        self.next_task.set(task + 1);
        let payload_json = serde_json::to_string(payload)?;

        let started = self.context.with(|ctx| -> Result<bool, BridgeError> {
            let handler = handler.restore(&ctx).map_err(|e| engine_error(&ctx, e))?;
            if !handler.is_function() {
                return Ok(false);
            }
            let track = self.hook(&ctx, "track")?;
            let payload = ctx
                .json_parse(payload_json)
                .map_err(|e| engine_error(&ctx, e))?;
            track
                .call::<_, ()>((task, handler, payload))
                .map_err(|e| engine_error(&ctx, e))?;
            Ok(true)
        })?;

        if !started {
            tracing::debug!(event, "registered handler is not a function");
            return Ok(serde_json::Value::Null);
        }
        tracing::debug!(event, task, "handler invoked");
        self.drive(task).await
    }

    async fn drive(&self, task: i32) -> Result<serde_json::Value, BridgeError> {
        let mut in_flight: JoinSet<RequestOutcome> = JoinSet::new();
        let mut timers: BinaryHeap<Reverse<(Instant, i32)>> = BinaryHeap::new();

        loop {
            self.run_pending_jobs();
            match self.take_task(task)? {
                TaskState::Pending => {}
                TaskState::Resolved { value } => return Ok(value),
                TaskState::Rejected { message } => return Err(BridgeError::Rejected(message)),
            }

            for (id, request) in self.state.outgoing.borrow_mut().drain(..) {
                in_flight.spawn(async move { (id, transport::send(request).await) });
            }
            let now = Instant::now();
            for (id, delay) in self.state.timers.borrow_mut().drain(..) {
                timers.push(Reverse((now + delay, id)));
            }

            if in_flight.is_empty() && timers.is_empty() {
                return Err(BridgeError::Stalled);
            }

            let next_deadline = timers.peek().map(|Reverse((deadline, _))| *deadline);
            tokio::select! {
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => match joined {
                    Ok((id, outcome)) => self.complete_request(id, outcome)?,
                    Err(err) => tracing::warn!(error = %err, "script request task failed"),
                },
                _ = tokio::time::sleep_until(next_deadline.unwrap_or(now)), if next_deadline.is_some() => {
                    let now = Instant::now();
                    while let Some(Reverse((deadline, id))) = timers.peek().copied() {
                        if deadline > now {
                            break;
                        }
                        timers.pop();
                        self.fire_timer(id)?;
                        self.run_pending_jobs();
                    }
                }
            }
        }
    }

    fn run_pending_jobs(&self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => tracing::warn!("uncaught exception in script job"),
            }
        }
    }

    fn take_task(&self, task: i32) -> Result<TaskState, BridgeError> {
        let json = self.context.with(|ctx| -> Result<String, BridgeError> {
            let take = self.hook(&ctx, "take")?;
            take.call((task,)).map_err(|e| engine_error(&ctx, e))
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    fn complete_request(
        &self,
        id: i32,
        outcome: Result<TransportResponse, TransportError>,
    ) -> Result<(), BridgeError> {
        let (error, response) = match outcome {
            Ok(response) => {
                tracing::debug!(id, status = response.status_code, "delivering response");
                (None, Some(response.to_json().to_string()))
            }
            Err(err) => {
                tracing::debug!(id, error = %err, "delivering request error");
                (Some(err.to_string()), None)
            }
        };
        self.context.with(|ctx| -> Result<(), BridgeError> {
            let complete = self.hook(&ctx, "completeRequest")?;
            complete
                .call::<_, ()>((id, error, response))
                .map_err(|e| engine_error(&ctx, e))
        })
    }

    fn fire_timer(&self, id: i32) -> Result<(), BridgeError> {
        self.context.with(|ctx| -> Result<(), BridgeError> {
            let fire = self.hook(&ctx, "fireTimer")?;
            fire.call::<_, ()>((id,)).map_err(|e| engine_error(&ctx, e))
        })
    }

    fn hook<'js>(&self, ctx: &Ctx<'js>, name: &str) -> Result<Function<'js>, BridgeError> {
        let hooks = self
            .hooks
            .clone()
            .restore(ctx)
            .map_err(|e| engine_error(ctx, e))?;
        hooks.get(name).map_err(|e| engine_error(ctx, e))
    }
}

impl Drop for ScriptHost {
    fn drop(&mut self) {
        // Persistent handles must go before the runtime they point into.
        self.state.bus.borrow_mut().clear();
    }
}

fn build_host_object<'js>(ctx: &Ctx<'js>, state: &Rc<HostState>) -> rquickjs::Result<Object<'js>> {
    let host = Object::new(ctx.clone())?;
    host.set("env", ENVIRONMENT_NAME)?;
    host.set("version", RUNTIME_VERSION)?;

    let event_names = Object::new(ctx.clone())?;
    for (constant, literal) in events::ALL {
        event_names.set(constant, literal)?;
    }
    host.set("events", event_names)?;

    let registry = Rc::clone(state);
    host.set(
        "register",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, name: String, handler: Value<'js>| {
                registry
                    .bus
                    .borrow_mut()
                    .register(name, Persistent::save(&ctx, handler));
            },
        )?,
    )?;

    let registry = Rc::clone(state);
    host.set(
        "lookup",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, name: String| -> rquickjs::Result<Value<'js>> {
                let handler = registry.bus.borrow().handler(&name).cloned();
                match handler {
                    Some(handler) => handler.restore(&ctx),
                    None => Ok(Value::new_undefined(ctx)),
                }
            },
        )?,
    )?;

    let outgoing = Rc::clone(state);
    host.set(
        "httpRequest",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, id: i32, url: String, options: String| -> rquickjs::Result<()> {
                let request = script_request(url, &options)
                    .map_err(|message| Exception::throw_message(&ctx, &message))?;
                outgoing.outgoing.borrow_mut().push((id, request));
                Ok(())
            },
        )?,
    )?;

    let timers = Rc::clone(state);
    host.set(
        "scheduleTimer",
        Function::new(ctx.clone(), move |id: i32, delay_ms: f64| {
            timers.timers.borrow_mut().push((id, timer_delay(delay_ms)));
        })?,
    )?;

    host.set(
        "bufferDecode",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, text: String, encoding: String| -> rquickjs::Result<String> {
                let encoding = parse_encoding(&ctx, &encoding)?;
                Ok(buffer::binary_string_from_bytes(&buffer::decode(
                    &text, encoding,
                )))
            },
        )?,
    )?;

    host.set(
        "bufferEncode",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, binary: String, encoding: String| -> rquickjs::Result<String> {
                let encoding = parse_encoding(&ctx, &encoding)?;
                Ok(buffer::encode(
                    &buffer::bytes_from_binary_string(&binary),
                    encoding,
                ))
            },
        )?,
    )?;

    host.set(
        "resolveModule",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, base_dir: String, specifier: String| -> rquickjs::Result<String> {
                resolve::resolve_module(Path::new(&base_dir), &specifier)
                    .map(|path| path.to_string_lossy().into_owned())
                    .map_err(|e| Exception::throw_message(&ctx, &e.to_string()))
            },
        )?,
    )?;

    host.set(
        "readModule",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, path: String| -> rquickjs::Result<String> {
                resolve::read_module(Path::new(&path))
                    .map_err(|e| Exception::throw_message(&ctx, &e.to_string()))
            },
        )?,
    )?;

    host.set(
        "dirname",
        Function::new(ctx.clone(), |path: String| -> String {
            Path::new(&path)
                .parent()
                .map(|dir| dir.to_string_lossy().into_owned())
                .unwrap_or_default()
        })?,
    )?;

    host.set(
        "log",
        Function::new(ctx.clone(), |level: String, message: String| {
            match level.as_str() {
                "error" => tracing::error!(target: "plugin", "{message}"),
                "warn" => tracing::warn!(target: "plugin", "{message}"),
                "debug" => tracing::debug!(target: "plugin", "{message}"),
                "trace" => tracing::trace!(target: "plugin", "{message}"),
                _ => tracing::info!(target: "plugin", "{message}"),
            }
        })?,
    )?;

    Ok(host)
}

/// Build and validate a request from what `lx.request` serialized, so bad
/// input fails synchronously in the script like it would under Node.
fn script_request(url: String, options: &str) -> Result<TransportRequest, String> {
    let options: ScriptRequestOptions =
        serde_json::from_str(options).map_err(|e| format!("invalid request options: {e}"))?;
    let mut request = TransportRequest::get(url).method(options.method);
    request.headers = options.headers.into_iter().collect();
    request.body = options.body.map(|body| match body {
        ScriptRequestBody::Text(text) => text.into_bytes(),
        ScriptRequestBody::Binary(binary) => buffer::bytes_from_binary_string(&binary),
    });
    transport::validate(&request).map_err(|e| e.to_string())?;
    Ok(request)
}

fn timer_delay(delay_ms: f64) -> Duration {
    if !(1.0..=MAX_TIMER_DELAY_MS).contains(&delay_ms) {
        return Duration::from_millis(if delay_ms > MAX_TIMER_DELAY_MS { 1 } else { 0 });
    }
    Duration::from_millis(delay_ms as u64)
}

fn parse_encoding(ctx: &Ctx<'_>, name: &str) -> rquickjs::Result<Encoding> {
    name.parse::<Encoding>()
        .map_err(|e| Exception::throw_type(ctx, &e.to_string()))
}

fn engine_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> BridgeError {
    BridgeError::Engine(js_error_message(ctx, err))
}

/// Message of the pending JS exception when `err` is one, else the Rust error text.
fn js_error_message(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    if !matches!(err, rquickjs::Error::Exception) {
        return err.to_string();
    }
    let thrown = ctx.catch();
    if let Some(object) = thrown.as_object() {
        if let Ok(message) = object.get::<_, String>("message") {
            return message;
        }
    }
    if let Some(text) = thrown.as_string() {
        if let Ok(text) = text.to_string() {
            return text;
        }
    }
    err.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn script(source: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".js").tempfile().unwrap();
        write!(file, "{source}").unwrap();
        file.flush().unwrap();
        file
    }

    fn loaded(source: &str) -> (ScriptHost, NamedTempFile) {
        let file = script(source);
        let host = ScriptHost::new().expect("runtime should start");
        host.load(file.path()).expect("script should load");
        (host, file)
    }

    async fn ask(host: &ScriptHost) -> Result<serde_json::Value, BridgeError> {
        host.dispatch(events::REQUEST, &serde_json::json!({ "action": "musicUrl" }))
            .await
    }

    #[tokio::test]
    async fn capability_object_exposes_fixed_metadata() {
        let (host, _file) = loaded(
            r#"
            lx.on(lx.EVENT_NAMES.request, () => [
                lx.env,
                lx.version,
                lx.EVENT_NAMES.request,
                lx.EVENT_NAMES.inited,
                lx.EVENT_NAMES.updateAlert,
                typeof lx.request,
                typeof lx.send,
                typeof lx.utils.buffer.from,
                typeof lx.utils.buffer.bufToString,
            ]);
            "#,
        );

        let value = ask(&host).await.unwrap();
        assert_eq!(
            value,
            serde_json::json!([
                "server", "external", "request", "inited", "updateAlert",
                "function", "function", "function", "function"
            ])
        );
    }

    #[tokio::test]
    async fn payload_reaches_handler() {
        let (host, _file) = loaded(
            r#"lx.on('request', ({ action, info }) => action + ':' + info.musicInfo.songmid + ':' + info.type);"#,
        );
        let payload = serde_json::json!({
            "action": "musicUrl",
            "source": "kw",
            "info": { "musicInfo": { "songmid": "42", "hash": "42" }, "type": "flac" }
        });

        let value = host.dispatch("request", &payload).await.unwrap();
        assert_eq!(value, "musicUrl:42:flac");
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let (host, _file) = loaded(
            r#"
            lx.on('request', () => 'first');
            lx.on('request', () => 'second');
            "#,
        );
        assert_eq!(ask(&host).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn unregistered_event_resolves_null() {
        let (host, _file) = loaded("// registers nothing");
        assert!(!host.has_handler("request"));
        assert_eq!(ask(&host).await.unwrap(), serde_json::Value::Null);
    }

    #[tokio::test]
    async fn non_function_registration_resolves_null() {
        let (host, _file) = loaded("lx.on('request', 'not a function');");
        assert!(host.has_handler("request"));
        assert_eq!(ask(&host).await.unwrap(), serde_json::Value::Null);
    }

    #[tokio::test]
    async fn send_from_script_goes_through_the_bus() {
        let (host, _file) = loaded(
            r#"
            lx.on('inner', (n) => n * 2);
            lx.on('request', async () => {
                const doubled = await lx.send('inner', 21);
                const missing = await lx.send('nobody', 1);
                return { doubled, missing: missing === undefined };
            });
            "#,
        );
        assert_eq!(
            ask(&host).await.unwrap(),
            serde_json::json!({ "doubled": 42, "missing": true })
        );
    }

    #[tokio::test]
    async fn sync_throw_and_async_rejection_are_rejections() {
        let (host, _file) = loaded(r#"lx.on('request', () => { throw new Error('rate limited'); });"#);
        let err = ask(&host).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Rejected);
        assert_eq!(err.to_string(), "rate limited");

        let (host, _file) = loaded(r#"lx.on('request', async () => Promise.reject('plain string'));"#);
        assert_eq!(ask(&host).await.unwrap_err().to_string(), "plain string");
    }

    #[tokio::test]
    async fn never_settling_handler_is_reported() {
        let (host, _file) = loaded(r#"lx.on('request', () => new Promise(() => {}));"#);
        let err = ask(&host).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Stalled);
    }

    #[tokio::test]
    async fn timers_drive_settlement() {
        let (host, _file) = loaded(
            r#"
            lx.on('request', () => new Promise((resolve) => {
                const order = [];
                const cancelled = setTimeout(() => order.push('cancelled'), 1);
                clearTimeout(cancelled);
                setTimeout(() => order.push('second'), 5);
                setTimeout(() => order.push('first'), 0);
                let ticks = 0;
                const interval = setInterval(() => {
                    ticks += 1;
                    if (ticks === 3) {
                        clearInterval(interval);
                        resolve(order.concat(['ticks:' + ticks]));
                    }
                }, 2);
            }));
            "#,
        );
        assert_eq!(
            ask(&host).await.unwrap(),
            serde_json::json!(["first", "second", "ticks:3"])
        );
    }

    #[tokio::test]
    async fn buffer_helpers_follow_node_encodings() {
        let (host, _file) = loaded(
            r#"
            lx.on('request', () => {
                const { from, bufToString } = lx.utils.buffer;
                const b64 = bufToString(from('hello lx', 'utf8'), 'base64');
                const back = from(b64, 'base64').toString();
                const hex = bufToString(from([0, 15, 255]), 'hex');
                const joined = Buffer.concat([from('ab'), Buffer.from('cd')]).toString();
                let unknown = null;
                try { from('x', 'klingon'); } catch (e) { unknown = e instanceof TypeError && e.message; }
                return { b64, back, hex, joined, unknown, isBuffer: Buffer.isBuffer(from('z')) };
            });
            "#,
        );
        assert_eq!(
            ask(&host).await.unwrap(),
            serde_json::json!({
                "b64": "aGVsbG8gbHg=",
                "back": "hello lx",
                "hex": "000fff",
                "joined": "abcd",
                "unknown": "Unknown encoding: klingon",
                "isBuffer": true
            })
        );
    }

    #[tokio::test]
    async fn console_output_does_not_break_dispatch() {
        let (host, _file) = loaded(
            r#"
            console.log('loading', { a: 1 });
            lx.on('request', () => { console.error(new Error('noisy')); return 'ok'; });
            "#,
        );
        assert_eq!(ask(&host).await.unwrap(), "ok");
    }

    #[test]
    fn missing_script_is_a_load_failure() {
        let host = ScriptHost::new().unwrap();
        let err = host
            .load(Path::new("/no/such/dir/source.js"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Load);
        assert_eq!(
            err.to_string(),
            "require script error: Cannot find module '/no/such/dir/source.js'"
        );
    }

    #[test]
    fn syntax_and_thrown_errors_are_load_failures() {
        let file = script("lx.on('request', () => {");
        let err = ScriptHost::new().unwrap().load(file.path()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Load);

        let file = script("throw new Error('needs a newer host');");
        let err = ScriptHost::new().unwrap().load(file.path()).unwrap_err();
        assert_eq!(err.to_string(), "require script error: needs a newer host");
    }

    #[test]
    fn node_builtins_are_missing_modules() {
        let file = script("const crypto = require('crypto');");
        let err = ScriptHost::new().unwrap().load(file.path()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "require script error: Cannot find module 'crypto'"
        );
    }

    #[tokio::test]
    async fn relative_requires_resolve_next_to_the_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(
            dir.path().join("lib/sign.js"),
            "module.exports = (id) => 'signed-' + id;",
        )
        .unwrap();
        std::fs::write(dir.path().join("lib/hosts.json"), r#"{"cdn":"https://cdn.example"}"#)
            .unwrap();
        std::fs::write(
            dir.path().join("source.js"),
            r#"
            const sign = require('./lib/sign');
            const hosts = require('./lib/hosts.json');
            lx.on('request', ({ info }) => hosts.cdn + '/' + sign(info.musicInfo.songmid));
            "#,
        )
        .unwrap();

        let host = ScriptHost::new().unwrap();
        host.load(&dir.path().join("source.js")).unwrap();
        let value = host
            .dispatch(
                "request",
                &serde_json::json!({ "info": { "musicInfo": { "songmid": "7" } } }),
            )
            .await
            .unwrap();
        assert_eq!(value, "https://cdn.example/signed-7");
    }

    #[tokio::test]
    async fn invalid_request_url_fails_synchronously() {
        let (host, _file) = loaded(
            r#"
            lx.on('request', () => new Promise((resolve) => {
                let sync = true;
                lx.request('::not a url::', {}, (err) => resolve({ sync, message: err && err.message }));
                sync = false;
            }));
            "#,
        );
        let value = ask(&host).await.unwrap();
        assert_eq!(value["sync"], true);
        assert_eq!(value["message"], "Invalid URL: ::not a url::");
    }

    #[tokio::test]
    async fn cancelled_request_never_calls_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("late"))
            .mount(&server)
            .await;
        let (host, _file) = loaded(&format!(
            r#"
            lx.on('request', () => new Promise((resolve) => {{
                const cancel = lx.request('{}', {{}}, () => resolve('callback ran'));
                cancel();
            }}));
            "#,
            server.uri()
        ));

        let err = ask(&host).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Stalled);
    }

    #[tokio::test]
    async fn buffer_alloc_and_byte_length() {
        let (host, _file) = loaded(
            r#"
            lx.on('request', () => ({
                zeroed: Array.from(Buffer.alloc(4)),
                filled: Array.from(Buffer.alloc(3, 7)),
                pattern: Buffer.alloc(5, 'ab').toString(),
                hexFill: Array.from(Buffer.alloc(4, 'ff00', 'hex')),
                utf8: Buffer.byteLength('héllo'),
                base64: Buffer.byteLength('aGk=', 'base64'),
                view: Buffer.byteLength(new Uint8Array(3)),
            }));
            "#,
        );
        assert_eq!(
            ask(&host).await.unwrap(),
            serde_json::json!({
                "zeroed": [0, 0, 0, 0],
                "filled": [7, 7, 7],
                "pattern": "ababa",
                "hexFill": [255, 0, 255, 0],
                "utf8": 6,
                "base64": 2,
                "view": 3
            })
        );
    }

    #[tokio::test]
    async fn microtasks_run_before_immediates() {
        let (host, _file) = loaded(
            r#"
            lx.on('request', () => new Promise((resolve) => {
                const order = [];
                setImmediate((tag) => { order.push(tag); resolve(order); }, 'immediate');
                queueMicrotask(() => order.push('microtask'));
                Promise.resolve().then(() => order.push('promise'));
                order.push('sync');
            }));
            "#,
        );
        assert_eq!(
            ask(&host).await.unwrap(),
            serde_json::json!(["sync", "microtask", "promise", "immediate"])
        );
    }

    #[tokio::test]
    async fn microtasks_drain_between_expired_timers() {
        let (host, _file) = loaded(
            r#"
            lx.on('request', () => new Promise((resolve) => {
                const order = [];
                setTimeout(() => {
                    order.push('first timer');
                    Promise.resolve().then(() => order.push('its microtask'));
                }, 0);
                setTimeout(() => {
                    order.push('second timer');
                    resolve(order.slice());
                }, 0);
            }));
            "#,
        );
        assert_eq!(
            ask(&host).await.unwrap(),
            serde_json::json!(["first timer", "its microtask", "second timer"])
        );
    }

    #[tokio::test]
    async fn unprintable_rejection_value_is_still_reported() {
        let (host, _file) = loaded(
            r#"lx.on('request', async () => { await null; throw Object.create(null); });"#,
        );
        let err = ask(&host).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Rejected);
        assert_eq!(err.to_string(), "[object Object]");
    }

    #[test]
    fn timer_delays_are_clamped() {
        assert_eq!(timer_delay(-5.0), Duration::ZERO);
        assert_eq!(timer_delay(f64::NAN), Duration::ZERO);
        assert_eq!(timer_delay(250.0), Duration::from_millis(250));
        assert_eq!(timer_delay(1e12), Duration::from_millis(1));
    }
}
