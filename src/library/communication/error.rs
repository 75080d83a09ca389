use super::super::BoxedError;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// Way in which a request handler failed
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The handler returned an error
    Error,
    /// The handler panicked
    Panic,
    /// The handler did not finish in time
    Timeout,
}

impl Display for FaultKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Error => write!(f, "error"),
            FaultKind::Panic => write!(f, "panic"),
            FaultKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Type erased, serializable handler failure which retains the error chain information
///
/// Remote callers don't know about the error types of a handler, so the error and each of
/// its causes are flattened into a list of messages. When the error from which this is created
/// contains another [`Fault`] in its source chain, it is consumed and integrated so that one
/// nicely formatted chain can be provided at the top-most level.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Fault {
    kind: FaultKind,
    causes: Vec<String>,
}

impl Fault {
    /// Creates a fault of the given kind from a list of messages, outermost first
    pub fn new(kind: FaultKind, causes: Vec<String>) -> Self {
        Self { kind, causes }
    }

    /// Creates a fault from an error returned by a handler
    ///
    /// A [`Fault`] at the top of the chain keeps its kind, anything else is an error.
    pub fn from_error(error: &BoxedError) -> Self {
        Self::from(error.as_ref() as &(dyn Error + 'static))
    }

    /// Creates a fault from the message of a caught panic
    pub fn panic(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Panic, vec![message.into()])
    }

    /// Creates a fault for a handler that exceeded its deadline
    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            FaultKind::Timeout,
            vec![format!("handler did not finish within {:?}", limit)],
        )
    }

    /// How the handler failed
    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    /// Messages of the error chain, outermost first
    pub fn causes(&self) -> &[String] {
        &self.causes
    }

    /// Single line description of the whole error chain
    pub fn description(&self) -> String {
        if self.causes.is_empty() {
            format!("unknown {}", self.kind)
        } else {
            self.causes.join(": ")
        }
    }
}

impl Error for Fault {}

impl Display for Fault {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(first) = self.causes.first() {
            writeln!(f, "Handler {}: {}", self.kind, first)?;
        } else {
            writeln!(f, "Unknown handler {}", self.kind)?;
            return Ok(());
        }

        if self.causes.len() > 1 {
            writeln!(f, "\nCaused by:")?;
            for (index, cause) in self.causes.iter().skip(1).enumerate() {
                writeln!(f, "    {}: {}", index, cause)?;
            }
        }

        Ok(())
    }
}

impl From<&(dyn Error + 'static)> for Fault {
    fn from(e: &(dyn Error + 'static)) -> Self {
        let mut source: Option<&(dyn Error + 'static)> = Some(e);
        let mut causes: Vec<String> = Vec::new();
        let mut kind = FaultKind::Error;

        while let Some(error) = source {
            // Integrate any child faults and use ToString for anything else
            if let Some(fault) = error.downcast_ref::<Fault>() {
                if causes.is_empty() {
                    kind = fault.kind;
                }
                causes.extend(fault.causes.iter().cloned());
            } else {
                causes.push(error.to_string());
            }

            source = error.source();
        }

        Self { kind, causes }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use thiserror::Error;

    #[derive(Error, Debug)]
    enum TestError {
        #[error("lookup failed")]
        Lookup(#[from] Fault),
        #[error("database unreachable")]
        Database(#[source] std::io::Error),
    }

    #[test]
    fn handle_no_cause() {
        let fault = Fault::new(FaultKind::Error, Vec::new());
        assert_eq!(fault.to_string(), "Unknown handler error\n");
        assert_eq!(fault.description(), "unknown error");
    }

    #[test]
    fn flatten_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "connection refused");
        let error: BoxedError = Box::new(TestError::Database(io));
        let fault = Fault::from_error(&error);

        assert_eq!(fault.kind(), FaultKind::Error);
        assert_eq!(
            fault.causes(),
            &["database unreachable".to_string(), "connection refused".to_string()]
        );
        assert_eq!(fault.description(), "database unreachable: connection refused");
    }

    #[test]
    fn keep_kind_of_returned_fault() {
        let error: BoxedError = Box::new(Fault::timeout(Duration::from_secs(2)));
        let fault = Fault::from_error(&error);

        assert_eq!(fault.kind(), FaultKind::Timeout);
        assert_eq!(fault.causes().len(), 1);
    }

    #[test]
    fn consume_nested() {
        let lower = Fault::new(FaultKind::Error, vec!["cause1".into(), "cause2".into()]);
        let middle = TestError::from(lower);
        let high = Fault::from(&middle as &(dyn Error + 'static));

        assert_eq!(high.causes(), &["lookup failed", "cause1", "cause2"]);
    }

    #[test]
    fn format_correctly() {
        let formatted = Fault::new(
            FaultKind::Panic,
            vec!["cause1".into(), "cause2".into(), "cause3".into()],
        )
        .to_string();

        assert_eq!(
            formatted,
            r#"Handler panic: cause1

Caused by:
    0: cause2
    1: cause3
"#
        )
    }

    #[test]
    fn serialize_kind_in_snake_case() {
        let fault = Fault::timeout(Duration::from_secs(1));
        let json = serde_json::to_value(&fault).unwrap();

        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["causes"][0], "handler did not finish within 1s");
    }
}
