use std::fmt;
use std::sync::Arc;

use crate::instr::Instr;
use crate::value::Complete;

/// The error value produced when an actor halts. A failed value binds
/// silently like any complete value, but touching it from a computation
/// halts the toucher, wrapping this value as the `cause` of a new failed
/// value carrying the toucher's address and current instruction.
#[derive(Debug)]
pub struct FailedValue {
    actor_address: String,
    error: Complete,
    current: Option<Arc<Instr>>,
    cause: Option<Arc<FailedValue>>,
    native_cause: Option<String>,
}

impl FailedValue {
    pub fn new(
        actor_address: String,
        error: Complete,
        current: Option<Arc<Instr>>,
        cause: Option<Arc<FailedValue>>,
        native_cause: Option<String>,
    ) -> FailedValue {
        FailedValue {
            actor_address,
            error,
            current,
            cause,
            native_cause,
        }
    }

    pub fn actor_address(&self) -> &str {
        &self.actor_address
    }

    pub fn error(&self) -> &Complete {
        &self.error
    }

    pub fn cause(&self) -> Option<&Arc<FailedValue>> {
        self.cause.as_ref()
    }

    pub fn native_cause(&self) -> Option<&str> {
        self.native_cause.as_deref()
    }

    /// Render the failure chain for diagnostic output.
    pub fn to_details_string(&self) -> String {
        let mut out = String::new();
        self.write_details(&mut out, 0);
        out
    }

    fn write_details(&self, out: &mut String, depth: usize) {
        let pad = "    ".repeat(depth);
        out.push_str(&format!("{pad}actor: {}\n", self.actor_address));
        out.push_str(&format!("{pad}error: {}\n", self.error));
        match &self.current {
            Some(instr) => out.push_str(&format!(
                "{pad}current: {} at {}\n",
                instr.label(),
                instr.span()
            )),
            None => out.push_str(&format!("{pad}current: <unknown>\n")),
        }
        if let Some(native_cause) = &self.native_cause {
            out.push_str(&format!("{pad}native cause: {native_cause}\n"));
        }
        if let Some(cause) = &self.cause {
            out.push_str(&format!("{pad}cause:\n"));
            cause.write_details(out, depth + 1);
        }
    }
}

impl fmt::Display for FailedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<failed at {}: {}>", self.actor_address, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_render_the_cause_chain() {
        let inner = Arc::new(FailedValue::new(
            "root/1".to_string(),
            Complete::str("boom"),
            None,
            None,
            Some("/ by zero".to_string()),
        ));
        let outer = FailedValue::new(
            "root".to_string(),
            Complete::str("boom"),
            None,
            Some(inner),
            None,
        );
        let details = outer.to_details_string();
        assert!(details.contains("actor: root\n"));
        assert!(details.contains("actor: root/1\n"));
        assert!(details.contains("native cause: / by zero"));
        let root_at = details.find("actor: root").unwrap();
        let child_at = details.find("actor: root/1").unwrap();
        assert!(root_at < child_at);
    }
}
