//! Router output parsing
//!
//! The router either answers directly or emits a forwarding block:
//!
//! ```text
//! ROUTE=gerente,memoria
//! PERGUNTA_ORIGINAL=<user message>
//! PERSONA=...
//! CLARIFY=
//! ```
//!
//! Tokens map onto [`Destination`]s. Memory is additive to one domain
//! destination, out-of-scope stands alone, and manager plus knowledge in one
//! route is rejected.

use tracing::debug;

const ROUTE_MARKER: &str = "ROUTE=";
const QUESTION_MARKER: &str = "PERGUNTA_ORIGINAL=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Destination {
    Manager,
    Knowledge,
    Memory,
    OutOfScope,
}

impl Destination {
    fn from_token(token: &str) -> Option<Self> {
        match token.to_lowercase().as_str() {
            "gerente" => Some(Self::Manager),
            "rag" => Some(Self::Knowledge),
            "memoria" | "memória" => Some(Self::Memory),
            "fora_escopo" => Some(Self::OutOfScope),
            _ => None,
        }
    }
}

/// Validated combination of destinations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Manager,
    Knowledge,
    ManagerWithMemory,
    KnowledgeWithMemory,
    Memory,
    OutOfScope,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("empty route")]
    Empty,

    #[error("unknown destination '{0}'")]
    UnknownToken(String),

    #[error("fora_escopo cannot be combined with other destinations")]
    ExclusiveOutOfScope,

    #[error("gerente and rag cannot share one route")]
    ConflictingDestinations,
}

impl Route {
    /// Parse the value of a `ROUTE=` line, e.g. `gerente,memoria`
    pub fn parse(value: &str) -> Result<Self, RouteError> {
        let mut destinations = Vec::new();
        for raw in value.split(',') {
            let token = raw.trim_matches(|c: char| c.is_whitespace() || c == '`' || c == '*' || c == '"');
            if token.is_empty() {
                continue;
            }
            let dest = Destination::from_token(token).ok_or_else(|| RouteError::UnknownToken(token.to_string()))?;
            if !destinations.contains(&dest) {
                destinations.push(dest);
            }
        }
        destinations.sort();

        use Destination::*;
        match destinations.as_slice() {
            [] => Err(RouteError::Empty),
            [Manager] => Ok(Self::Manager),
            [Knowledge] => Ok(Self::Knowledge),
            [Memory] => Ok(Self::Memory),
            [OutOfScope] => Ok(Self::OutOfScope),
            [Manager, Memory] => Ok(Self::ManagerWithMemory),
            [Knowledge, Memory] => Ok(Self::KnowledgeWithMemory),
            d if d.contains(&OutOfScope) => Err(RouteError::ExclusiveOutOfScope),
            _ => Err(RouteError::ConflictingDestinations),
        }
    }
}

/// A forwarding decision taken from the router output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub route: Route,
    /// Router output without the route line, handed to the destinations
    pub forwarded: String,
    /// The `PERGUNTA_ORIGINAL=` value, when present
    pub question: Option<String>,
}

impl RoutingDecision {
    /// Question to evaluate an answer against
    pub fn question_or_forwarded(&self) -> &str {
        self.question.as_deref().unwrap_or(&self.forwarded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterOutput {
    /// No route line: the text is the final answer
    Direct(String),
    Routed(RoutingDecision),
}

/// Parse raw router output. Only the first `ROUTE=` line counts.
pub fn parse_router_output(raw: &str) -> Result<RouterOutput, RouteError> {
    let Some(route_line_idx) = raw.lines().position(|l| l.contains(ROUTE_MARKER)) else {
        return Ok(RouterOutput::Direct(raw.to_string()));
    };

    let lines: Vec<&str> = raw.lines().collect();
    let route_line = lines[route_line_idx];
    let value = route_line
        .split_once(ROUTE_MARKER)
        .map(|(_, rest)| rest)
        .unwrap_or_default();
    let route = Route::parse(value)?;

    let forwarded = lines
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != route_line_idx)
        .map(|(_, l)| *l)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();

    let question = lines
        .iter()
        .filter_map(|l| l.trim_start().strip_prefix(QUESTION_MARKER))
        .map(str::trim)
        .find(|q| !q.is_empty())
        .map(str::to_string);

    debug!("Parsed route {:?} (question present: {})", route, question.is_some());

    Ok(RouterOutput::Routed(RoutingDecision {
        route,
        forwarded,
        question,
    }))
}
