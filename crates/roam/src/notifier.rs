//! Report the outcome of a function call as a chat message.
//!
//! A [`CallNotifier`] holds the shared sender. [`CallNotifier::notify`] turns a
//! [`NotifierConfig`] into a reusable [`Decorator`], and [`Decorator::wrap`]
//! produces a [`Notified`] function with the same argument and result types as
//! the one it wraps.
//!
//! On success the optional success template is rendered and sent. On failure
//! the failure template is rendered with the error text and sent, then the
//! original error is returned. A panic in the wrapped function is reported
//! as a failure (`func_exception` is `panic: <message>`) and then resumed.
//! Notification is best effort: render and send failures are logged and never
//! reach the caller.
//!
//! Wrapped functions are async: `Fn(A) -> impl Future<Output = Result<T, E>>`
//! keeps its exact signature. A synchronous `Fn(A) -> Result<T, E>` goes
//! through [`Decorator::wrap_sync`] and keeps its argument and result types,
//! but the call is awaited since the notification itself is sent over the
//! network. Multiple arguments are passed as one tuple or struct.

use std::any::Any;
use std::fmt;
use std::future::{self, Future};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDateTime;
use futures::FutureExt;
use serde::Serialize;

use crate::client::{ChannelSet, MessageSender};
use crate::template::{Template, TemplateBindings, TemplateError};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const FUNC_NAME: &str = "func_name";
pub const FUNC_START_TIME: &str = "func_start_time";
pub const FUNC_END_TIME: &str = "func_end_time";
pub const FUNC_EXCEPTION: &str = "func_exception";

pub const DID_NOT_FAIL: &str = "DID NOT FAIL";
pub const DID_NOT_COMPLETE: &str = "DID NOT COMPLETE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("a failure message template is required")]
    MissingFailureTemplate,
    #[error("invalid {which} template: {source}")]
    InvalidTemplate {
        which: &'static str,
        #[source]
        source: TemplateError,
    },
}

/// Source of call timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

pub fn format_timestamp(at: NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    failure: Template,
    success: Option<Template>,
    channels: Option<ChannelSet>,
}

impl NotifierConfig {
    pub fn builder() -> NotifierConfigBuilder {
        NotifierConfigBuilder::default()
    }

    /// Failure-only config sent to the sender's default channels.
    pub fn new(message: impl Into<String>) -> Result<Self, ConfigError> {
        Self::builder().message(message).build()
    }

    pub fn failure_template(&self) -> &Template {
        &self.failure
    }

    pub fn success_template(&self) -> Option<&Template> {
        self.success.as_ref()
    }

    pub fn channels(&self) -> Option<&ChannelSet> {
        self.channels.as_ref()
    }
}

#[derive(Debug, Default, Clone)]
pub struct NotifierConfigBuilder {
    message: Option<String>,
    message_success: Option<String>,
    channels: Option<ChannelSet>,
}

impl NotifierConfigBuilder {
    /// Template sent when the call fails. Required.
    pub fn message(mut self, template: impl Into<String>) -> Self {
        self.message = Some(template.into());
        self
    }

    /// Template sent when the call succeeds. Without it, success is silent.
    pub fn message_success(mut self, template: impl Into<String>) -> Self {
        self.message_success = Some(template.into());
        self
    }

    /// Replaces the sender's default channels for this notifier.
    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> Result<NotifierConfig, ConfigError> {
        let message = self.message.ok_or(ConfigError::MissingFailureTemplate)?;
        let failure = Template::parse(&message).map_err(|source| ConfigError::InvalidTemplate {
            which: "failure",
            source,
        })?;
        let success = self
            .message_success
            .map(|m| Template::parse(&m))
            .transpose()
            .map_err(|source| ConfigError::InvalidTemplate {
                which: "success",
                source,
            })?;
        Ok(NotifierConfig {
            failure,
            success,
            channels: self.channels,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(String),
}

/// One invocation of a notified function.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub function_name: String,
    pub start_time: NaiveDateTime,
    /// Only set when the call returned successfully.
    pub end_time: Option<NaiveDateTime>,
    pub outcome: Option<Outcome>,
}

impl CallContext {
    fn start(function_name: &str, start_time: NaiveDateTime) -> Self {
        Self {
            function_name: function_name.to_string(),
            start_time,
            end_time: None,
            outcome: None,
        }
    }

    fn succeed(&mut self, end_time: NaiveDateTime) {
        self.end_time = Some(end_time);
        self.outcome = Some(Outcome::Success);
    }

    fn fail(&mut self, error_text: String) {
        self.outcome = Some(Outcome::Failure(error_text));
    }

    /// Layer the reserved keys over the argument bindings.
    pub fn bindings(&self, mut bindings: TemplateBindings) -> TemplateBindings {
        bindings.insert(FUNC_NAME, self.function_name.as_str());
        bindings.insert(FUNC_START_TIME, format_timestamp(self.start_time));
        match &self.outcome {
            Some(Outcome::Success) => {
                let end = self.end_time.map(format_timestamp).unwrap_or_default();
                bindings.insert(FUNC_END_TIME, end);
                bindings.insert(FUNC_EXCEPTION, DID_NOT_FAIL);
            }
            Some(Outcome::Failure(error_text)) => {
                bindings.insert(FUNC_END_TIME, DID_NOT_COMPLETE);
                bindings.insert(FUNC_EXCEPTION, error_text.as_str());
            }
            None => {}
        }
        bindings
    }
}

/// Shared entry point: one sender and clock for any number of notifiers.
#[derive(Clone)]
pub struct CallNotifier {
    sender: Arc<dyn MessageSender>,
    clock: Arc<dyn Clock>,
}

impl CallNotifier {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self {
            sender,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn notify(&self, config: NotifierConfig) -> Decorator {
        Decorator {
            notifier: self.clone(),
            config: Arc::new(config),
        }
    }

    pub fn wrap<F>(&self, name: impl Into<String>, config: NotifierConfig, func: F) -> Notified<F> {
        self.notify(config).wrap(name, func)
    }

    async fn report(&self, ctx: &CallContext, args: TemplateBindings, config: &NotifierConfig) {
        let template = match ctx.outcome {
            Some(Outcome::Failure(_)) => &config.failure,
            _ => match &config.success {
                Some(template) => template,
                None => return,
            },
        };

        let function = ctx.function_name.as_str();
        let message = match template.render(&ctx.bindings(args)) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(function, error = %err, "notification not sent: template did not render");
                return;
            }
        };
        if let Err(err) = self.sender.send(&message, config.channels()).await {
            tracing::warn!(function, error = %err, "notification dispatch failed");
        }
    }
}

impl fmt::Debug for CallNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallNotifier").finish_non_exhaustive()
    }
}

/// A notifier config bound to a sender, ready to wrap functions.
#[derive(Debug, Clone)]
pub struct Decorator {
    notifier: CallNotifier,
    config: Arc<NotifierConfig>,
}

impl Decorator {
    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    pub fn wrap<F>(&self, name: impl Into<String>, func: F) -> Notified<F> {
        Notified {
            inner: Arc::new(NotifiedInner {
                name: name.into(),
                func,
                config: Arc::clone(&self.config),
                notifier: self.notifier.clone(),
            }),
        }
    }

    /// Wrap a synchronous function. It runs on the caller's task when called.
    pub fn wrap_sync<F, A, T, E>(
        &self,
        name: impl Into<String>,
        func: F,
    ) -> Notified<impl Fn(A) -> future::Ready<Result<T, E>>>
    where
        F: Fn(A) -> Result<T, E>,
    {
        self.wrap(name, move |args: A| future::ready(func(args)))
    }
}

/// Wrap a function with a [`Decorator`], using the function's own name.
#[macro_export]
macro_rules! wrap {
    ($decorator:expr, $func:ident) => {
        $decorator.wrap(stringify!($func), $func)
    };
}

struct NotifiedInner<F> {
    name: String,
    func: F,
    config: Arc<NotifierConfig>,
    notifier: CallNotifier,
}

/// A wrapped async function. Clones share the function and config.
pub struct Notified<F> {
    inner: Arc<NotifiedInner<F>>,
}

impl<F> Clone for Notified<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F> fmt::Debug for Notified<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notified")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<F> Notified<F> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Invoke the wrapped function and report its outcome.
    ///
    /// The returned future does not borrow `self`, so a `Notified` can itself
    /// be wrapped again; the inner notification is dispatched first.
    pub fn call<A, Fut, T, E>(&self, args: A) -> impl Future<Output = Result<T, E>>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        A: Serialize,
        E: fmt::Display,
    {
        let inner = Arc::clone(&self.inner);
        let mut ctx = CallContext::start(&inner.name, inner.notifier.clock.now());
        let arg_bindings = TemplateBindings::from_args(&args);
        let started = Instant::now();
        let pending = panic::catch_unwind(AssertUnwindSafe(|| (inner.func)(args)));

        async move {
            tracing::debug!(function = %inner.name, "call started");
            let completed = match pending {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(payload) => Err(payload),
            };
            match &completed {
                Ok(Ok(_)) => ctx.succeed(inner.notifier.clock.now()),
                Ok(Err(err)) => ctx.fail(err.to_string()),
                Err(payload) => ctx.fail(format!("panic: {}", panic_message(&**payload))),
            }
            tracing::debug!(
                function = %inner.name,
                outcome = ?ctx.outcome,
                duration_ms = started.elapsed().as_millis() as u64,
                "call finished"
            );
            inner.notifier.report(&ctx, arg_bindings, &inner.config).await;
            match completed {
                Ok(result) => result,
                Err(payload) => panic::resume_unwind(payload),
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{resolve_channels, SendError, SendErrorKind};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSender {
        defaults: ChannelSet,
        fail: bool,
        sent: Mutex<Vec<(String, ChannelSet)>>,
    }

    impl RecordingSender {
        fn with_defaults(defaults: &[&str]) -> Self {
            Self {
                defaults: defaults.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::with_defaults(&["a"])
            }
        }

        fn messages(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
        }
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send(&self, message: &str, channels: Option<&ChannelSet>) -> Result<(), SendError> {
            let recipients = resolve_channels(&self.defaults, channels)?;
            if self.fail {
                return Err(SendError::remote(SendErrorKind::Network, "connection refused"));
            }
            self.sent.lock().unwrap().push((message.to_string(), recipients));
            Ok(())
        }

        async fn list_channels(&self) -> Result<Vec<String>, SendError> {
            Ok(self.defaults.iter().cloned().collect())
        }
    }

    struct FixedClock(NaiveDateTime);

    impl Clock for FixedClock {
        fn now(&self) -> NaiveDateTime {
            self.0
        }
    }

    #[derive(Debug, PartialEq)]
    struct ValueError(String);

    impl fmt::Display for ValueError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    #[derive(Serialize)]
    struct Args {
        arg1: &'static str,
    }

    fn notifier(sender: &Arc<RecordingSender>) -> CallNotifier {
        let midnight = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        CallNotifier::new(sender.clone()).with_clock(Arc::new(FixedClock(midnight)))
    }

    async fn function(args: Args) -> Result<usize, ValueError> {
        Ok(args.arg1.len())
    }

    async fn failing(_: ()) -> Result<(), ValueError> {
        Err(ValueError("bad".into()))
    }

    #[tokio::test]
    async fn success_without_success_template_sends_nothing() {
        let sender = Arc::new(RecordingSender::with_defaults(&["a"]));
        let config = NotifierConfig::new("{func_name} failed").unwrap();
        let wrapped = notifier(&sender).wrap("function", config, function);

        assert_eq!(wrapped.call(Args { arg1: "Hello" }).await, Ok(5));
        assert!(sender.messages().is_empty());
    }

    #[tokio::test]
    async fn success_template_renders_arguments_and_times() {
        let sender = Arc::new(RecordingSender::with_defaults(&["a"]));
        let config = NotifierConfig::builder()
            .message("{func_name} failed")
            .message_success("{func_name}:{func_start_time}: At {arg1} -> <{func_exception}> until {func_end_time}")
            .build()
            .unwrap();
        let decorator = notifier(&sender).notify(config);
        let wrapped = crate::wrap!(decorator, function);

        assert_eq!(wrapped.name(), "function");
        assert_eq!(wrapped.call(Args { arg1: "Hello" }).await, Ok(5));
        assert_eq!(
            sender.messages(),
            vec!["function:2024-01-01 00:00:00: At Hello -> <DID NOT FAIL> until 2024-01-01 00:00:00"]
        );
    }

    #[tokio::test]
    async fn failure_reports_error_text_and_propagates_error() {
        let sender = Arc::new(RecordingSender::with_defaults(&["a"]));
        let config = NotifierConfig::new("{func_name} failed: {func_exception} ({func_end_time})").unwrap();
        let wrapped = notifier(&sender).wrap("function", config, failing);

        assert_eq!(wrapped.call(()).await, Err(ValueError("bad".into())));
        assert_eq!(sender.messages(), vec!["function failed: bad (DID NOT COMPLETE)"]);
    }

    #[tokio::test]
    async fn send_failure_never_reaches_the_caller() {
        let sender = Arc::new(RecordingSender::failing());
        let config = NotifierConfig::builder()
            .message("{func_name} failed")
            .message_success("{func_name} ok")
            .build()
            .unwrap();
        let decorator = notifier(&sender).notify(config);

        let ok = decorator.wrap("function", function);
        assert_eq!(ok.call(Args { arg1: "abc" }).await, Ok(3));

        let err = decorator.wrap("failing", failing);
        assert_eq!(err.call(()).await, Err(ValueError("bad".into())));
    }

    #[tokio::test]
    async fn unresolved_placeholder_skips_the_message_only() {
        let sender = Arc::new(RecordingSender::with_defaults(&["a"]));
        let config = NotifierConfig::builder()
            .message("{table} failed")
            .message_success("{table} loaded")
            .build()
            .unwrap();
        let decorator = notifier(&sender).notify(config);

        assert_eq!(decorator.wrap("function", function).call(Args { arg1: "x" }).await, Ok(1));
        assert_eq!(
            decorator.wrap("failing", failing).call(()).await,
            Err(ValueError("bad".into()))
        );
        assert!(sender.messages().is_empty());
    }

    #[tokio::test]
    async fn reserved_keys_override_arguments() {
        #[derive(Serialize)]
        struct Spoof {
            func_name: &'static str,
        }

        let sender = Arc::new(RecordingSender::with_defaults(&["a"]));
        let config = NotifierConfig::builder()
            .message("x")
            .message_success("{func_name}")
            .build()
            .unwrap();
        let wrapped = notifier(&sender).wrap("real", config, |_: Spoof| async {
            Ok::<_, ValueError>(())
        });

        wrapped.call(Spoof { func_name: "spoofed" }).await.unwrap();
        assert_eq!(sender.messages(), vec!["real"]);
    }

    #[tokio::test]
    async fn config_channels_replace_sender_defaults() {
        let sender = Arc::new(RecordingSender::with_defaults(&["a", "b"]));
        let notifier = notifier(&sender);

        let defaults = NotifierConfig::new("{func_name}").unwrap();
        let explicit = NotifierConfig::builder()
            .message("{func_name}")
            .channels(["c"])
            .build()
            .unwrap();

        let _ = notifier.wrap("one", defaults, failing).call(()).await;
        let _ = notifier.wrap("two", explicit, failing).call(()).await;

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent[0].1, ChannelSet::from(["a".to_string(), "b".to_string()]));
        assert_eq!(sent[1].1, ChannelSet::from(["c".to_string()]));
    }

    #[tokio::test]
    async fn nested_wrapping_dispatches_inner_first() {
        let sender = Arc::new(RecordingSender::with_defaults(&["a"]));
        let notifier = notifier(&sender);
        let inner_cfg = NotifierConfig::builder()
            .message("inner failed")
            .message_success("inner {arg1}")
            .build()
            .unwrap();
        let outer_cfg = NotifierConfig::builder()
            .message("outer failed")
            .message_success("outer {arg1}")
            .build()
            .unwrap();

        let inner = notifier.wrap("function", inner_cfg, function);
        let outer = notifier.wrap("function", outer_cfg, move |args: Args| inner.call(args));

        assert_eq!(outer.call(Args { arg1: "Hi" }).await, Ok(2));
        assert_eq!(sender.messages(), vec!["inner Hi", "outer Hi"]);
    }

    #[tokio::test]
    async fn concurrent_calls_keep_their_own_bindings() {
        let sender = Arc::new(RecordingSender::with_defaults(&["a"]));
        let config = NotifierConfig::builder()
            .message("failed")
            .message_success("done {arg1}")
            .build()
            .unwrap();
        let wrapped = notifier(&sender).wrap("function", config, function);

        let (left, right) = tokio::join!(
            wrapped.call(Args { arg1: "left" }),
            wrapped.clone().call(Args { arg1: "right" })
        );
        assert_eq!((left, right), (Ok(4), Ok(5)));

        let mut messages = sender.messages();
        messages.sort();
        assert_eq!(messages, vec!["done left", "done right"]);
    }

    #[tokio::test]
    async fn panic_is_reported_then_resumed() {
        let sender = Arc::new(RecordingSender::with_defaults(&["a"]));
        let decorator = notifier(&sender).notify(NotifierConfig::new("{func_name}: {func_exception}").unwrap());

        let in_future = decorator.wrap("exploding", |_: ()| async {
            if std::hint::black_box(true) {
                panic!("boom");
            }
            Ok::<(), ValueError>(())
        });
        let joined = tokio::spawn(in_future.call(())).await;
        assert!(joined.unwrap_err().is_panic());

        let before_future = decorator.wrap("eager", |_: ()| -> future::Ready<Result<(), ValueError>> {
            panic!("{} went wrong", "setup")
        });
        let joined = tokio::spawn(before_future.call(())).await;
        assert!(joined.unwrap_err().is_panic());

        assert_eq!(
            sender.messages(),
            vec!["exploding: panic: boom", "eager: panic: setup went wrong"]
        );
    }

    #[tokio::test]
    async fn sync_functions_keep_argument_and_result_types() {
        fn parse(raw: String) -> Result<i32, std::num::ParseIntError> {
            raw.trim().parse()
        }

        let sender = Arc::new(RecordingSender::with_defaults(&["a"]));
        let config = NotifierConfig::builder()
            .message("{func_name} could not read '{0}': {func_exception}")
            .message_success("{func_name} read {0}")
            .build()
            .unwrap();
        let decorator = notifier(&sender).notify(config);
        let wrapped = decorator.wrap_sync("parse", parse);

        assert_eq!(wrapped.call("17".to_string()).await, Ok(17));
        assert!(wrapped.call("x".to_string()).await.is_err());
        assert_eq!(
            sender.messages(),
            vec![
                "parse read 17",
                "parse could not read 'x': invalid digit found in string",
            ]
        );
    }

    #[test]
    fn failure_template_is_required() {
        assert_matches!(
            NotifierConfig::builder().message_success("ok").build(),
            Err(ConfigError::MissingFailureTemplate)
        );
        assert_matches!(
            NotifierConfig::new("{unclosed"),
            Err(ConfigError::InvalidTemplate { which: "failure", .. })
        );
        assert_matches!(
            NotifierConfig::builder().message("x").message_success("}").build(),
            Err(ConfigError::InvalidTemplate { which: "success", .. })
        );
    }

    #[test]
    fn timestamps_use_fixed_pattern() {
        let at = NaiveDate::from_ymd_opt(2023, 8, 30)
            .unwrap()
            .and_hms_opt(14, 35, 5)
            .unwrap();
        assert_eq!(format_timestamp(at), "2023-08-30 14:35:05");
    }
}
