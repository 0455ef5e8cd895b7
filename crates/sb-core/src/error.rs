use thiserror::Error;

use crate::value::ScriptValue;

#[derive(Debug, Error, Clone)]
pub enum BridgeError {
    #[error("Cannot convert {from} to {to}{}", argument_suffix(.index))]
    ConversionFailure {
        from: String,
        to: String,
        index: Option<usize>,
    },
    #[error("{target} has no member named \"{member}\"")]
    MemberNotFound { target: String, member: String },
    #[error("Referencing deleted native object ({class_name})")]
    DeletedNativeObject { class_name: String },
    #[error("{message}")]
    OverloadResolution {
        method: String,
        argument_count: usize,
        message: String,
    },
    #[error("Script engine has been destroyed")]
    EngineDestroyed,
    #[error("{operation} called off the engine thread")]
    ThreadAffinity { operation: String },
    #[error("{message}")]
    Thrown {
        message: String,
        file: Option<String>,
        line: Option<usize>,
        value: Option<ScriptValue>,
    },
    #[error("{file}:{line}:{column}: {message}")]
    Syntax {
        file: String,
        line: usize,
        column: usize,
        message: String,
    },
    #[error("Evaluation aborted")]
    Aborted,
    #[error("{what} is not a function")]
    NotCallable { what: String },
    #[error("{message}")]
    NativeFailure { message: String },
    #[error("Value handle does not refer to a live object")]
    InvalidHandle,
    #[error("{message}")]
    InvalidArgument { message: String },
}

impl BridgeError {
    pub fn conversion(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::ConversionFailure {
            from: from.into(),
            to: to.into(),
            index: None,
        }
    }

    /// Records which call argument failed to convert. Other errors pass
    /// through unchanged.
    pub fn at_argument(self, position: usize) -> Self {
        match self {
            Self::ConversionFailure { from, to, .. } => Self::ConversionFailure {
                from,
                to,
                index: Some(position),
            },
            other => other,
        }
    }

    pub fn argument_index(&self) -> Option<usize> {
        match self {
            Self::ConversionFailure { index, .. } => *index,
            _ => None,
        }
    }

    pub fn member_not_found(target: impl Into<String>, member: impl Into<String>) -> Self {
        Self::MemberNotFound {
            target: target.into(),
            member: member.into(),
        }
    }

    pub fn native(message: impl Into<String>) -> Self {
        Self::NativeFailure {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn thrown(message: impl Into<String>) -> Self {
        Self::Thrown {
            message: message.into(),
            file: None,
            line: None,
            value: None,
        }
    }

    /// Stable machine-readable code, asserted on by hosts and tests.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConversionFailure { .. } => "BRIDGE_CONVERSION",
            Self::MemberNotFound { .. } => "BRIDGE_MEMBER_NOT_FOUND",
            Self::DeletedNativeObject { .. } => "BRIDGE_DELETED_NATIVE_OBJECT",
            Self::OverloadResolution { .. } => "BRIDGE_OVERLOAD_RESOLUTION",
            Self::EngineDestroyed => "BRIDGE_ENGINE_DESTROYED",
            Self::ThreadAffinity { .. } => "BRIDGE_THREAD_AFFINITY",
            Self::Thrown { .. } => "BRIDGE_THROWN",
            Self::Syntax { .. } => "BRIDGE_SYNTAX",
            Self::Aborted => "BRIDGE_ABORTED",
            Self::NotCallable { .. } => "BRIDGE_NOT_CALLABLE",
            Self::NativeFailure { .. } => "BRIDGE_NATIVE_FAILURE",
            Self::InvalidHandle => "BRIDGE_INVALID_HANDLE",
            Self::InvalidArgument { .. } => "BRIDGE_INVALID_ARGUMENT",
        }
    }

    /// Name of the script-visible error object built from this error.
    pub fn script_name(&self) -> &'static str {
        match self {
            Self::ConversionFailure { .. }
            | Self::OverloadResolution { .. }
            | Self::NotCallable { .. } => "TypeError",
            Self::MemberNotFound { .. } | Self::DeletedNativeObject { .. } => "ReferenceError",
            Self::Syntax { .. } => "SyntaxError",
            Self::InvalidArgument { .. } => "RangeError",
            _ => "Error",
        }
    }

    /// Programming errors rather than script-recoverable failures.
    pub fn is_guard_violation(&self) -> bool {
        matches!(self, Self::EngineDestroyed | Self::ThreadAffinity { .. })
    }
}

fn argument_suffix(index: &Option<usize>) -> String {
    index.map_or_else(String::new, |index| format!(" (argument {})", index + 1))
}
