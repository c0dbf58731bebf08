//! Values owned by a stack that may be consumed from another stack.

use serde_json::Value;

use crate::intrinsics;

/// A value handed from one builder to another.
///
/// Literal tokens are emitted as-is wherever they are used. `Ref` and
/// `GetAtt` tokens remember the deployed name of the stack that owns the
/// resource; resolving them inside that stack yields the plain intrinsic,
/// resolving them anywhere else yields an `Fn::ImportValue` of the export
/// the owner will publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A value that needs no wiring (a string, a number, a pseudo parameter).
    Literal(Value),
    /// `Ref` of a resource in `stack`.
    Ref { stack: String, logical_id: String },
    /// `Fn::GetAtt` of a resource attribute in `stack`.
    GetAtt {
        stack: String,
        logical_id: String,
        attribute: String,
    },
    /// An arbitrary expression evaluated inside `stack` and published under
    /// `name`, such as a value derived from a resource attribute.
    Expr {
        stack: String,
        name: String,
        value: Value,
    },
}

impl Token {
    /// Wrap a literal value.
    #[must_use]
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Stack that owns this token, if any.
    #[must_use]
    pub fn stack(&self) -> Option<&str> {
        match self {
            Self::Literal(_) => None,
            Self::Ref { stack, .. } | Self::GetAtt { stack, .. } | Self::Expr { stack, .. } => {
                Some(stack)
            }
        }
    }

    /// Logical id of the resource behind this token, if any.
    #[must_use]
    pub fn logical_id(&self) -> Option<&str> {
        match self {
            Self::Literal(_) | Self::Expr { .. } => None,
            Self::Ref { logical_id, .. } | Self::GetAtt { logical_id, .. } => Some(logical_id),
        }
    }

    /// The expression as written inside the owning stack.
    #[must_use]
    pub fn local_expr(&self) -> Value {
        match self {
            Self::Literal(value) | Self::Expr { value, .. } => value.clone(),
            Self::Ref { logical_id, .. } => intrinsics::reference(logical_id),
            Self::GetAtt {
                logical_id,
                attribute,
                ..
            } => intrinsics::get_att(logical_id, attribute),
        }
    }

    /// Logical id of the `Outputs` entry that exports this token.
    #[must_use]
    pub fn output_id(&self) -> Option<String> {
        match self {
            Self::Literal(_) => None,
            Self::Ref { logical_id, .. } => Some(format!("ExportsOutputRef{logical_id}")),
            Self::GetAtt {
                logical_id,
                attribute,
                ..
            } => {
                let attribute: String = attribute
                    .chars()
                    .filter(char::is_ascii_alphanumeric)
                    .collect();
                Some(format!("ExportsOutputFnGetAtt{logical_id}{attribute}"))
            }
            Self::Expr { name, .. } => Some(format!("ExportsOutput{name}")),
        }
    }

    /// Export name under which the owning stack publishes this token.
    #[must_use]
    pub fn export_name(&self) -> Option<String> {
        let stack = self.stack()?;
        let output_id = self.output_id()?;
        Some(format!("{stack}:{output_id}"))
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self::literal(value)
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self::literal(value)
    }
}
