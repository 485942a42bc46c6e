use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::value::{CompleteOrIdent, Ident, Literal, LiteralOrIdent};

/// A half-open source range carried by every instruction for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceSpan {
    pub begin: u32,
    pub end: u32,
}

impl SourceSpan {
    pub fn new(begin: u32, end: u32) -> SourceSpan {
        SourceSpan { begin, end }
    }
}

impl fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.begin, self.end)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mult,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mult => "*",
            BinOp::Div => "//",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        };
        write!(f, "{text}")
    }
}

/// A procedure definition: parameters, body, and the free identifiers the
/// body references, computed once at construction.
#[derive(Debug)]
pub struct ProcDef {
    pub params: Vec<Ident>,
    pub body: Arc<Instr>,
    pub free: Vec<Ident>,
    pub span: SourceSpan,
}

impl ProcDef {
    pub fn new(params: Vec<Ident>, body: Arc<Instr>, span: SourceSpan) -> ProcDef {
        let mut bound: HashSet<Ident> = params.iter().cloned().collect();
        let mut free = Vec::new();
        body.capture_free(&mut bound, &mut free);
        ProcDef {
            params,
            body,
            free,
            span,
        }
    }
}

/// A pattern in `case` and `try/catch`. Capture identifiers bind fresh in
/// the matched branch; escaped identifiers compare against the environment.
#[derive(Clone, Debug)]
pub enum Pat {
    Literal(Literal),
    Capture(Ident),
    Esc(Ident),
    Rec {
        label: LiteralOrIdent,
        fields: Vec<(LiteralOrIdent, Pat)>,
        partial: bool,
    },
    Tuple {
        label: LiteralOrIdent,
        values: Vec<Pat>,
        partial: bool,
    },
}

/// The kernel instruction set: a closed sum matched exhaustively by the
/// machine.
#[derive(Debug)]
pub enum Instr {
    Local {
        idents: Vec<Ident>,
        body: Arc<Instr>,
        span: SourceSpan,
    },
    Seq {
        body: Vec<Arc<Instr>>,
        span: SourceSpan,
    },
    Bind {
        left: CompleteOrIdent,
        right: CompleteOrIdent,
        span: SourceSpan,
    },
    Op {
        op: BinOp,
        left: CompleteOrIdent,
        right: CompleteOrIdent,
        target: CompleteOrIdent,
        span: SourceSpan,
    },
    CreateRec {
        label: LiteralOrIdent,
        fields: Vec<(LiteralOrIdent, CompleteOrIdent)>,
        target: CompleteOrIdent,
        span: SourceSpan,
    },
    CreateTuple {
        label: LiteralOrIdent,
        values: Vec<CompleteOrIdent>,
        target: CompleteOrIdent,
        span: SourceSpan,
    },
    CreateProc {
        def: Arc<ProcDef>,
        target: Ident,
        span: SourceSpan,
    },
    CreateActorCfg {
        ctor: CompleteOrIdent,
        args: Vec<CompleteOrIdent>,
        target: CompleteOrIdent,
        span: SourceSpan,
    },
    Select {
        rec: CompleteOrIdent,
        feature: LiteralOrIdent,
        target: CompleteOrIdent,
        span: SourceSpan,
    },
    SelectApply {
        rec: CompleteOrIdent,
        feature: LiteralOrIdent,
        args: Vec<CompleteOrIdent>,
        span: SourceSpan,
    },
    Apply {
        proc: CompleteOrIdent,
        args: Vec<CompleteOrIdent>,
        span: SourceSpan,
    },
    If {
        cond: CompleteOrIdent,
        consequent: Arc<Instr>,
        alternate: Option<Arc<Instr>>,
        span: SourceSpan,
    },
    Case {
        of: CompleteOrIdent,
        pattern: Pat,
        consequent: Arc<Instr>,
        alternate: Option<Arc<Instr>>,
        span: SourceSpan,
    },
    Throw {
        value: CompleteOrIdent,
        span: SourceSpan,
    },
    TryCatch {
        body: Arc<Instr>,
        pattern: Pat,
        handler: Arc<Instr>,
        span: SourceSpan,
    },
    Act {
        body: Arc<Instr>,
        target: Ident,
        span: SourceSpan,
    },
}

impl Instr {
    pub fn span(&self) -> SourceSpan {
        match self {
            Instr::Local { span, .. }
            | Instr::Seq { span, .. }
            | Instr::Bind { span, .. }
            | Instr::Op { span, .. }
            | Instr::CreateRec { span, .. }
            | Instr::CreateTuple { span, .. }
            | Instr::CreateProc { span, .. }
            | Instr::CreateActorCfg { span, .. }
            | Instr::Select { span, .. }
            | Instr::SelectApply { span, .. }
            | Instr::Apply { span, .. }
            | Instr::If { span, .. }
            | Instr::Case { span, .. }
            | Instr::Throw { span, .. }
            | Instr::TryCatch { span, .. }
            | Instr::Act { span, .. } => *span,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Instr::Local { .. } => "local",
            Instr::Seq { .. } => "seq",
            Instr::Bind { .. } => "bind",
            Instr::Op { .. } => "op",
            Instr::CreateRec { .. } => "create_rec",
            Instr::CreateTuple { .. } => "create_tuple",
            Instr::CreateProc { .. } => "create_proc",
            Instr::CreateActorCfg { .. } => "create_actor_cfg",
            Instr::Select { .. } => "select",
            Instr::SelectApply { .. } => "select_apply",
            Instr::Apply { .. } => "apply",
            Instr::If { .. } => "if",
            Instr::Case { .. } => "case",
            Instr::Throw { .. } => "throw",
            Instr::TryCatch { .. } => "try",
            Instr::Act { .. } => "act",
        }
    }

    /// The lexically free identifiers of this instruction, in first-use
    /// order.
    pub fn free_idents(&self) -> Vec<Ident> {
        let mut bound = HashSet::new();
        let mut free = Vec::new();
        self.capture_free(&mut bound, &mut free);
        free
    }

    pub(crate) fn capture_free(&self, bound: &mut HashSet<Ident>, free: &mut Vec<Ident>) {
        match self {
            Instr::Local { idents, body, .. } => {
                let mut inner = bound.clone();
                inner.extend(idents.iter().cloned());
                body.capture_free(&mut inner, free);
            }
            Instr::Seq { body, .. } => {
                for instr in body {
                    instr.capture_free(bound, free);
                }
            }
            Instr::Bind { left, right, .. } => {
                note_operand(left, bound, free);
                note_operand(right, bound, free);
            }
            Instr::Op {
                left,
                right,
                target,
                ..
            } => {
                note_operand(left, bound, free);
                note_operand(right, bound, free);
                note_operand(target, bound, free);
            }
            Instr::CreateRec {
                label,
                fields,
                target,
                ..
            } => {
                note_literal_operand(label, bound, free);
                for (feature, value) in fields {
                    note_literal_operand(feature, bound, free);
                    note_operand(value, bound, free);
                }
                note_operand(target, bound, free);
            }
            Instr::CreateTuple {
                label,
                values,
                target,
                ..
            } => {
                note_literal_operand(label, bound, free);
                for value in values {
                    note_operand(value, bound, free);
                }
                note_operand(target, bound, free);
            }
            Instr::CreateProc { def, target, .. } => {
                for ident in &def.free {
                    note_ident(ident, bound, free);
                }
                note_ident(target, bound, free);
            }
            Instr::CreateActorCfg {
                ctor, args, target, ..
            } => {
                note_operand(ctor, bound, free);
                for arg in args {
                    note_operand(arg, bound, free);
                }
                note_operand(target, bound, free);
            }
            Instr::Select {
                rec,
                feature,
                target,
                ..
            } => {
                note_operand(rec, bound, free);
                note_literal_operand(feature, bound, free);
                note_operand(target, bound, free);
            }
            Instr::SelectApply {
                rec, feature, args, ..
            } => {
                note_operand(rec, bound, free);
                note_literal_operand(feature, bound, free);
                for arg in args {
                    note_operand(arg, bound, free);
                }
            }
            Instr::Apply { proc, args, .. } => {
                note_operand(proc, bound, free);
                for arg in args {
                    note_operand(arg, bound, free);
                }
            }
            Instr::If {
                cond,
                consequent,
                alternate,
                ..
            } => {
                note_operand(cond, bound, free);
                consequent.capture_free(&mut bound.clone(), free);
                if let Some(alternate) = alternate {
                    alternate.capture_free(&mut bound.clone(), free);
                }
            }
            Instr::Case {
                of,
                pattern,
                consequent,
                alternate,
                ..
            } => {
                note_operand(of, bound, free);
                let mut with_captures = bound.clone();
                pattern_free(pattern, &mut with_captures, bound, free);
                consequent.capture_free(&mut with_captures, free);
                if let Some(alternate) = alternate {
                    alternate.capture_free(&mut bound.clone(), free);
                }
            }
            Instr::Throw { value, .. } => {
                note_operand(value, bound, free);
            }
            Instr::TryCatch {
                body,
                pattern,
                handler,
                ..
            } => {
                body.capture_free(&mut bound.clone(), free);
                let mut with_captures = bound.clone();
                pattern_free(pattern, &mut with_captures, bound, free);
                handler.capture_free(&mut with_captures, free);
            }
            Instr::Act { body, target, .. } => {
                // The instruction dispatches through the `act` intrinsic.
                note_ident(&Ident::act(), bound, free);
                body.capture_free(&mut bound.clone(), free);
                note_ident(target, bound, free);
            }
        }
    }
}

fn note_ident(ident: &Ident, bound: &HashSet<Ident>, free: &mut Vec<Ident>) {
    if !bound.contains(ident) && !free.contains(ident) {
        free.push(ident.clone());
    }
}

fn note_operand(operand: &CompleteOrIdent, bound: &HashSet<Ident>, free: &mut Vec<Ident>) {
    if let CompleteOrIdent::Ident(ident) = operand {
        note_ident(ident, bound, free);
    }
}

fn note_literal_operand(operand: &LiteralOrIdent, bound: &HashSet<Ident>, free: &mut Vec<Ident>) {
    if let LiteralOrIdent::Ident(ident) = operand {
        note_ident(ident, bound, free);
    }
}

/// Note a pattern's free identifiers and add its captures to the branch
/// scope.
fn pattern_free(
    pattern: &Pat,
    branch_bound: &mut HashSet<Ident>,
    bound: &HashSet<Ident>,
    free: &mut Vec<Ident>,
) {
    match pattern {
        Pat::Literal(_) => {}
        Pat::Capture(ident) => {
            branch_bound.insert(ident.clone());
        }
        Pat::Esc(ident) => note_ident(ident, bound, free),
        Pat::Rec { label, fields, .. } => {
            note_literal_operand(label, bound, free);
            for (feature, sub) in fields {
                note_literal_operand(feature, bound, free);
                pattern_free(sub, branch_bound, bound, free);
            }
        }
        Pat::Tuple { label, values, .. } => {
            note_literal_operand(label, bound, free);
            for sub in values {
                pattern_free(sub, branch_bound, bound, free);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(name: &str) -> Ident {
        Ident::new(name)
    }

    #[test]
    fn local_binds_its_idents() {
        let instr = Instr::Local {
            idents: vec![ident("x")],
            body: Arc::new(Instr::Bind {
                left: CompleteOrIdent::ident("x"),
                right: CompleteOrIdent::ident("y"),
                span: SourceSpan::default(),
            }),
            span: SourceSpan::default(),
        };
        assert_eq!(instr.free_idents(), vec![ident("y")]);
    }

    #[test]
    fn case_captures_bind_in_consequent_only() {
        let instr = Instr::Case {
            of: CompleteOrIdent::ident("subject"),
            pattern: Pat::Capture(ident("x")),
            consequent: Arc::new(Instr::Bind {
                left: CompleteOrIdent::ident("x"),
                right: CompleteOrIdent::ident("out"),
                span: SourceSpan::default(),
            }),
            alternate: Some(Arc::new(Instr::Bind {
                left: CompleteOrIdent::ident("x"),
                right: CompleteOrIdent::ident("out"),
                span: SourceSpan::default(),
            })),
            span: SourceSpan::default(),
        };
        // `x` is free in the alternate, bound in the consequent.
        assert_eq!(
            instr.free_idents(),
            vec![ident("subject"), ident("out"), ident("x")]
        );
    }

    #[test]
    fn proc_def_excludes_params() {
        let def = ProcDef::new(
            vec![ident("n")],
            Arc::new(Instr::Op {
                op: BinOp::Add,
                left: CompleteOrIdent::ident("n"),
                right: CompleteOrIdent::ident("k"),
                target: CompleteOrIdent::ident("out"),
                span: SourceSpan::default(),
            }),
            SourceSpan::default(),
        );
        assert_eq!(def.free, vec![ident("k"), ident("out")]);
    }
}
