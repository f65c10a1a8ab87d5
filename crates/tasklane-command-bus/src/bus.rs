//! Command dispatch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tasklane_core::command::{Command, CommandKind};
use tasklane_core::context::OperationContext;
use tasklane_core::error::DomainError;
use tracing::{error, info, warn};

use crate::handler::CommandHandler;

/// Routes commands of type `C` to handlers producing `R`.
///
/// Registration happens at startup; dispatch only reads.
pub struct CommandBus<C: Command, R> {
    bound: HashMap<C::Kind, Arc<dyn CommandHandler<C, R>>>,
    fallback: Vec<Arc<dyn CommandHandler<C, R>>>,
}

impl<C: Command, R> Default for CommandBus<C, R> {
    fn default() -> Self {
        Self {
            bound: HashMap::new(),
            fallback: Vec::new(),
        }
    }
}

impl<C: Command, R> fmt::Debug for CommandBus<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBus")
            .field("bound", &self.bound.keys().collect::<Vec<_>>())
            .field(
                "fallback",
                &self.fallback.iter().map(|h| h.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<C: Command, R> CommandBus<C, R> {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateHandler` when the handler's kind is already bound,
    /// or when a fallback handler with the same name is already registered.
    pub fn register(&mut self, handler: Arc<dyn CommandHandler<C, R>>) -> Result<(), DomainError> {
        match handler.command_kind() {
            Some(kind) => {
                if self.bound.contains_key(&kind) {
                    return Err(DomainError::DuplicateHandler(kind.name().to_owned()));
                }
                info!(handler = handler.name(), command_type = kind.name(), "command handler registered");
                self.bound.insert(kind, handler);
            }
            None => {
                if self.fallback.iter().any(|h| h.name() == handler.name()) {
                    return Err(DomainError::DuplicateHandler(handler.name().to_owned()));
                }
                info!(handler = handler.name(), "fallback command handler registered");
                self.fallback.push(handler);
            }
        }
        Ok(())
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bound.len() + self.fallback.len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resolve(&self, command: &C) -> Result<&Arc<dyn CommandHandler<C, R>>, DomainError> {
        if let Some(handler) = self.bound.get(&command.kind()) {
            return Ok(handler);
        }
        let mut claimants = self.fallback.iter().filter(|h| h.can_handle(command));
        match (claimants.next(), claimants.count()) {
            (None, _) => Err(DomainError::HandlerNotFound(
                command.command_type().to_owned(),
            )),
            (Some(handler), 0) => Ok(handler),
            (Some(_), others) => Err(DomainError::AmbiguousHandler {
                command_type: command.command_type().to_owned(),
                candidates: others + 1,
            }),
        }
    }

    /// Validates `command`, routes it to its handler and runs it under `cx`.
    ///
    /// # Errors
    ///
    /// Returns `Validation` when the command is malformed, `HandlerNotFound`
    /// or `AmbiguousHandler` when routing fails, or the handler's error.
    pub async fn send(&self, cx: &OperationContext, command: C) -> Result<R, DomainError> {
        let metadata = command.metadata().clone();
        let command_type = command.command_type();

        if let Err(e) = command.validate() {
            warn!(
                command_id = %metadata.command_id,
                command_type,
                error = %e,
                "command rejected"
            );
            return Err(e);
        }

        let handler = self.resolve(&command).inspect_err(|e| {
            error!(
                command_id = %metadata.command_id,
                command_type,
                error = %e,
                "command not routed"
            );
        })?;

        info!(
            command_id = %metadata.command_id,
            correlation_id = ?metadata.correlation_id,
            user_id = ?metadata.user_id,
            command_type,
            handler = handler.name(),
            "executing command"
        );
        let started = Instant::now();
        let result = handler.handle(cx, command).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &result {
            Ok(_) => info!(
                command_id = %metadata.command_id,
                correlation_id = ?metadata.correlation_id,
                user_id = ?metadata.user_id,
                command_type,
                duration_ms,
                "command succeeded"
            ),
            Err(e) => error!(
                command_id = %metadata.command_id,
                correlation_id = ?metadata.correlation_id,
                user_id = ?metadata.user_id,
                command_type,
                duration_ms,
                error = %e,
                "command failed"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use tasklane_core::command::CommandMetadata;
    use tasklane_test_support::FixedClock;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum NoteKind {
        Create,
        Rename,
        Archive,
    }

    impl CommandKind for NoteKind {
        fn name(self) -> &'static str {
            match self {
                Self::Create => "CreateNote",
                Self::Rename => "RenameNote",
                Self::Archive => "ArchiveNote",
            }
        }
    }

    #[derive(Debug)]
    struct NoteCommand {
        kind: NoteKind,
        title: String,
        metadata: CommandMetadata,
    }

    impl NoteCommand {
        fn new(kind: NoteKind, title: &str) -> Self {
            let clock = FixedClock(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
            Self {
                kind,
                title: title.to_owned(),
                metadata: CommandMetadata::new(&clock),
            }
        }
    }

    impl Command for NoteCommand {
        type Kind = NoteKind;

        fn kind(&self) -> NoteKind {
            self.kind
        }

        fn metadata(&self) -> &CommandMetadata {
            &self.metadata
        }

        fn validate(&self) -> Result<(), DomainError> {
            if self.title.is_empty() {
                return Err(DomainError::Validation("title must not be empty".into()));
            }
            Ok(())
        }
    }

    struct Bound {
        kind: NoteKind,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CommandHandler<NoteCommand, String> for Bound {
        fn name(&self) -> &'static str {
            "bound"
        }

        fn command_kind(&self) -> Option<NoteKind> {
            Some(self.kind)
        }

        async fn handle(
            &self,
            _cx: &OperationContext,
            command: NoteCommand,
        ) -> Result<String, DomainError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("bound:{}", command.title))
        }
    }

    struct Family {
        name: &'static str,
        kinds: Vec<NoteKind>,
    }

    #[async_trait]
    impl CommandHandler<NoteCommand, String> for Family {
        fn name(&self) -> &'static str {
            self.name
        }

        fn can_handle(&self, command: &NoteCommand) -> bool {
            self.kinds.contains(&command.kind)
        }

        async fn handle(
            &self,
            cx: &OperationContext,
            command: NoteCommand,
        ) -> Result<String, DomainError> {
            if cx.is_cancelled() {
                return Err(DomainError::Cancelled);
            }
            if command.title == "boom" {
                return Err(DomainError::Infrastructure("disk full".into()));
            }
            Ok(format!("{}:{}", self.name, command.title))
        }
    }

    fn bound(kind: NoteKind) -> Arc<Bound> {
        Arc::new(Bound {
            kind,
            calls: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn test_send_routes_to_the_bound_handler() {
        // Arrange
        let mut bus: CommandBus<NoteCommand, String> = CommandBus::new();
        let handler = bound(NoteKind::Create);
        bus.register(handler.clone()).unwrap();

        // Act
        let result = bus
            .send(&OperationContext::background(), NoteCommand::new(NoteKind::Create, "draft"))
            .await;

        // Assert
        assert_eq!(result.unwrap(), "bound:draft");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registering_a_kind_twice_fails_immediately() {
        let mut bus: CommandBus<NoteCommand, String> = CommandBus::new();
        bus.register(bound(NoteKind::Create)).unwrap();

        let result = bus.register(bound(NoteKind::Create));

        match result {
            Err(DomainError::DuplicateHandler(name)) => assert_eq!(name, "CreateNote"),
            other => panic!("expected DuplicateHandler, got {other:?}"),
        }
        assert_eq!(bus.len(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_not_found_and_runs_nothing() {
        let mut bus: CommandBus<NoteCommand, String> = CommandBus::new();
        let handler = bound(NoteKind::Create);
        bus.register(handler.clone()).unwrap();

        let result = bus
            .send(&OperationContext::background(), NoteCommand::new(NoteKind::Archive, "old"))
            .await;

        match result {
            Err(DomainError::HandlerNotFound(name)) => assert_eq!(name, "ArchiveNote"),
            other => panic!("expected HandlerNotFound, got {other:?}"),
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fallback_handler_claims_a_family_of_kinds() {
        let mut bus: CommandBus<NoteCommand, String> = CommandBus::new();
        bus.register(Arc::new(Family {
            name: "edits",
            kinds: vec![NoteKind::Rename, NoteKind::Archive],
        }))
        .unwrap();

        let renamed = bus
            .send(&OperationContext::background(), NoteCommand::new(NoteKind::Rename, "a"))
            .await;
        let archived = bus
            .send(&OperationContext::background(), NoteCommand::new(NoteKind::Archive, "b"))
            .await;

        assert_eq!(renamed.unwrap(), "edits:a");
        assert_eq!(archived.unwrap(), "edits:b");
    }

    #[tokio::test]
    async fn test_bound_handler_wins_over_fallback() {
        let mut bus: CommandBus<NoteCommand, String> = CommandBus::new();
        bus.register(Arc::new(Family {
            name: "all",
            kinds: vec![NoteKind::Create, NoteKind::Rename],
        }))
        .unwrap();
        bus.register(bound(NoteKind::Create)).unwrap();

        let result = bus
            .send(&OperationContext::background(), NoteCommand::new(NoteKind::Create, "x"))
            .await;

        assert_eq!(result.unwrap(), "bound:x");
    }

    #[tokio::test]
    async fn test_two_claiming_fallbacks_are_ambiguous() {
        let mut bus: CommandBus<NoteCommand, String> = CommandBus::new();
        for name in ["first", "second"] {
            bus.register(Arc::new(Family {
                name,
                kinds: vec![NoteKind::Rename],
            }))
            .unwrap();
        }

        let result = bus
            .send(&OperationContext::background(), NoteCommand::new(NoteKind::Rename, "x"))
            .await;

        match result {
            Err(DomainError::AmbiguousHandler { candidates, .. }) => assert_eq!(candidates, 2),
            other => panic!("expected AmbiguousHandler, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_command_never_reaches_a_handler() {
        let mut bus: CommandBus<NoteCommand, String> = CommandBus::new();
        let handler = bound(NoteKind::Create);
        bus.register(handler.clone()).unwrap();

        let result = bus
            .send(&OperationContext::background(), NoteCommand::new(NoteKind::Create, ""))
            .await;

        assert!(matches!(result, Err(DomainError::Validation(_))));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_caller_context_reaches_the_handler() {
        // Arrange
        let mut bus: CommandBus<NoteCommand, String> = CommandBus::new();
        bus.register(Arc::new(Family {
            name: "edits",
            kinds: vec![NoteKind::Rename],
        }))
        .unwrap();
        let (cx, handle) = OperationContext::cancellable();
        handle.cancel();

        // Act
        let result = bus
            .send(&cx, NoteCommand::new(NoteKind::Rename, "late"))
            .await;

        // Assert
        match result {
            Err(DomainError::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }

    #[derive(Clone)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_outcome_logs_carry_the_user() {
        // Arrange
        let logs = LogBuffer(Arc::new(Mutex::new(Vec::new())));
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(logs.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);
        let mut bus: CommandBus<NoteCommand, String> = CommandBus::new();
        bus.register(bound(NoteKind::Create)).unwrap();
        bus.register(Arc::new(Family {
            name: "edits",
            kinds: vec![NoteKind::Rename],
        }))
        .unwrap();
        let clock = FixedClock(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let user_id = CommandMetadata::new(&clock).command_id;
        let as_user = |kind, title: &str| NoteCommand {
            metadata: CommandMetadata::new(&clock).with_user(user_id),
            ..NoteCommand::new(kind, title)
        };
        let cx = OperationContext::background();

        // Act
        let ok = bus.send(&cx, as_user(NoteKind::Create, "draft")).await;
        let failed = bus.send(&cx, as_user(NoteKind::Rename, "boom")).await;

        // Assert
        assert!(ok.is_ok());
        assert!(failed.is_err());
        let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let user = format!("user_id=Some({user_id})");
        for message in ["command succeeded", "command failed"] {
            let line = text
                .lines()
                .find(|line| line.contains(message))
                .unwrap_or_else(|| panic!("no {message:?} line in {text}"));
            assert!(line.contains(&user), "{line}");
        }
    }

    #[tokio::test]
    async fn test_handler_errors_are_returned_unchanged() {
        let mut bus: CommandBus<NoteCommand, String> = CommandBus::new();
        bus.register(Arc::new(Family {
            name: "edits",
            kinds: vec![NoteKind::Rename],
        }))
        .unwrap();

        let result = bus
            .send(&OperationContext::background(), NoteCommand::new(NoteKind::Rename, "boom"))
            .await;

        match result {
            Err(DomainError::Infrastructure(message)) => assert_eq!(message, "disk full"),
            other => panic!("expected Infrastructure, got {other:?}"),
        }
    }
}
