pub mod context;
pub mod diagnostic;
pub mod protocol;
pub mod rule;
pub mod udr;

pub use context::{BuildFileContext, Context, IncludeContext};
pub use diagnostic::{Diagnostic, DiagnosticLevel, ExceptionInfo};
pub use protocol::{PackageImplicitLoad, Query, Response};
pub use rule::RuleRecord;
pub use udr::{Attribute, UserDefinedRule};
