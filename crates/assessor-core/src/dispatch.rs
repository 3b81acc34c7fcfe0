//! Dispatch orchestrator
//!
//! One inbound message goes through: load the session's memories, classify
//! with the router, run the destination generators for the parsed route,
//! fuse their outputs and ask the router for the final phrasing.
//!
//! | Route              | Calls                                   | Origin            |
//! |--------------------|-----------------------------------------|-------------------|
//! | gerente,memoria    | curator ∥ manager, fusion               | CURADORIA_GERENTE |
//! | rag,memoria        | curator ∥ retrieval→knowledge, fusion   | CURADORIA_RAG     |
//! | rag                | retrieval→knowledge, evaluator, fusion  | RAG               |
//! | gerente            | manager, fusion                         | GERENTE           |
//! | memoria            | curator                                 | CURADORIA         |
//! | fora_escopo        | none                                    | FORA_ESCOPO       |
//! | no route line      | none                                    | ASSISTENTE        |

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use assessor_knowledge::{DEFAULT_TOP_K, KnowledgeRetriever, Ledger, LedgerError, MemoryStore, ReferenceKind};

use crate::error::{AssessorError, AssessorResult, Stage};
use crate::generator::{Generator, Role};
use crate::history::{Channel, HistoryStore};
use crate::prompts;
use crate::providers::{Backends, DEFAULT_MAX_ITERATIONS};
use crate::route::{Route, RouterOutput, RoutingDecision, parse_router_output};
use crate::tools::ToolRegistry;
use crate::tools::ledger::register_ledger_tools;
use crate::tools::memory::register_memory_tools;

/// Prefix of the user-visible text for a failed dispatch
pub const ERROR_PREFIX: &str = "Erro ao processar fluxo: ";

/// Where the final answer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OriginLabel {
    CuradoriaRag,
    CuradoriaGerente,
    Rag,
    Gerente,
    Curadoria,
    Assistente,
    ForaEscopo,
    Erro,
}

impl OriginLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CuradoriaRag => "CURADORIA_RAG",
            Self::CuradoriaGerente => "CURADORIA_GERENTE",
            Self::Rag => "RAG",
            Self::Gerente => "GERENTE",
            Self::Curadoria => "CURADORIA",
            Self::Assistente => "ASSISTENTE",
            Self::ForaEscopo => "FORA_ESCOPO",
            Self::Erro => "ERRO",
        }
    }

    /// Lowercase tag written on the `ORIGEM=` line of the fusion payload
    pub fn fusion_tag(&self) -> String {
        self.as_str().to_lowercase()
    }
}

impl std::fmt::Display for OriginLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final answer of one dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    #[serde(rename = "resposta")]
    pub text: String,
    #[serde(rename = "origem")]
    pub origin: OriginLabel,
}

impl DispatchOutcome {
    pub fn new(text: impl Into<String>, origin: OriginLabel) -> Self {
        Self {
            text: text.into(),
            origin,
        }
    }

    /// User-visible payload for a failed dispatch
    pub fn error_payload(err: &AssessorError) -> Self {
        Self::new(format!("{}{}", ERROR_PREFIX, err), OriginLabel::Erro)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Bound on every external call, in seconds
    pub call_timeout_secs: u64,
    pub max_tool_iterations: usize,
    pub max_history_messages: usize,
    pub retrieval_k: usize,
    /// Offset used for the date shown in prompts
    pub utc_offset_hours: i32,
    /// Reply when the curator handled a memory-only message silently
    pub memory_ack: String,
    pub out_of_scope_reply: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            call_timeout_secs: 120,
            max_tool_iterations: DEFAULT_MAX_ITERATIONS,
            max_history_messages: 40,
            retrieval_k: DEFAULT_TOP_K,
            utc_offset_hours: -3,
            memory_ack: "Anotado! Vou lembrar disso.".to_string(),
            out_of_scope_reply: "Consigo ajudar apenas com a gestão das ETAs, consultas técnicas e o registro das suas \
                                 informações. Quer fazer algum desses?"
                .to_string(),
        }
    }
}

impl DispatchSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }
}

/// Stores shared by every request
#[derive(Clone)]
pub struct Services {
    pub ledger: Ledger,
    pub memory: Arc<dyn MemoryStore>,
    pub retriever: KnowledgeRetriever,
    pub histories: Arc<HistoryStore>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

/// Resolve a requester email to its session id (the employee id)
pub async fn resolve_session(ledger: &Ledger, email: &str, timeout: Duration) -> AssessorResult<String> {
    let email = email.trim();
    if email.is_empty() {
        return Err(AssessorError::InvalidInput("email is required".to_string()));
    }
    match tokio::time::timeout(timeout, ledger.find_employee_id(email)).await {
        Ok(Ok(id)) => Ok(id.to_string()),
        Ok(Err(LedgerError::ReferenceNotFound {
            kind: ReferenceKind::Employee,
            ..
        })) => Err(AssessorError::SessionNotFound(email.to_string())),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(AssessorError::Timeout {
            stage: Stage::Session,
            secs: timeout.as_secs(),
        }),
    }
}

pub struct Dispatcher {
    backends: Backends,
    ledger_tools: Arc<ToolRegistry>,
    evaluator: Generator,
    memory: Arc<dyn MemoryStore>,
    retriever: KnowledgeRetriever,
    histories: Arc<HistoryStore>,
    settings: DispatchSettings,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backends", &self.backends)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn build_generator(role: Role, backends: &Backends, settings: &DispatchSettings) -> Generator {
    let provider = match role {
        Role::Manager | Role::Curator => backends.main.clone(),
        Role::Router | Role::Knowledge | Role::Evaluator => backends.flash.clone(),
    };
    Generator::new(role, provider)
        .with_max_iterations(settings.max_tool_iterations)
        .with_utc_offset(settings.utc_offset_hours)
}

/// Generators bound to one session's history channels and memory log
struct SessionAgents {
    router: Generator,
    manager: Generator,
    knowledge: Generator,
    curator: Generator,
}

impl Dispatcher {
    pub fn new(backends: Backends, services: Services, settings: DispatchSettings) -> Self {
        let Services {
            ledger,
            memory,
            retriever,
            histories,
        } = services;

        let mut ledger_tools = ToolRegistry::new();
        register_ledger_tools(&mut ledger_tools, &ledger);

        Self {
            evaluator: build_generator(Role::Evaluator, &backends, &settings),
            backends,
            ledger_tools: Arc::new(ledger_tools),
            memory,
            retriever,
            histories,
            settings,
        }
    }

    fn build(&self, role: Role) -> Generator {
        build_generator(role, &self.backends, &self.settings)
    }

    fn agents(&self, session_id: &str) -> SessionAgents {
        let max_history = self.settings.max_history_messages;
        let channel = |c: Channel| self.histories.channel(session_id, c);

        let mut memory_tools = ToolRegistry::new();
        register_memory_tools(&mut memory_tools, self.memory.clone(), session_id);

        SessionAgents {
            router: self.build(Role::Router).with_history(channel(Channel::Router), max_history),
            manager: self
                .build(Role::Manager)
                .with_tools(self.ledger_tools.clone())
                .with_history(channel(Channel::Manager), max_history),
            knowledge: self
                .build(Role::Knowledge)
                .with_history(channel(Channel::Knowledge), max_history),
            curator: self
                .build(Role::Curator)
                .with_tools(Arc::new(memory_tools))
                .with_history(channel(Channel::Curator), max_history)
                .silent(),
        }
    }

    /// Bound an external call and map its failure
    async fn bounded<T, E, F>(&self, stage: Stage, fut: F, on_err: impl FnOnce(E) -> AssessorError) -> AssessorResult<T>
    where
        F: Future<Output = Result<T, E>>,
    {
        let timeout = self.settings.call_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result.map_err(on_err),
            Err(_) => {
                warn!("{} call timed out after {:?}", stage, timeout);
                Err(AssessorError::Timeout {
                    stage,
                    secs: timeout.as_secs(),
                })
            }
        }
    }

    async fn generate(&self, stage: Stage, generator: &Generator, input: &str) -> AssessorResult<String> {
        self.bounded(stage, generator.generate(input), |e| AssessorError::at_stage(stage, e))
            .await
    }

    /// Memory list for the router input. An outage degrades to an explicit
    /// marker instead of an empty list.
    async fn load_memories(&self, session_id: &str) -> String {
        match self
            .bounded(Stage::Memory, self.memory.list_all(session_id), AssessorError::from)
            .await
        {
            Ok(records) => {
                debug!("Loaded {} memories for session {}", records.len(), session_id);
                prompts::format_memories(&records)
            }
            Err(e) => {
                warn!("Continuing without memories for session {}: {}", session_id, e);
                prompts::MEMORY_UNAVAILABLE.to_string()
            }
        }
    }

    async fn curate(&self, agents: &SessionAgents, text: &str, session_id: &str) -> AssessorResult<String> {
        self.generate(Stage::Curator, &agents.curator, &prompts::curator_input(text, session_id))
            .await
    }

    /// Curator output for a compound route; a failure only costs the memory update
    async fn curate_best_effort(&self, agents: &SessionAgents, text: &str, session_id: &str) -> String {
        match self.curate(agents, text, session_id).await {
            Ok(out) => out,
            Err(e) => {
                warn!("Curator failed, continuing without it: {}", e);
                String::new()
            }
        }
    }

    async fn manage(&self, agents: &SessionAgents, text: &str) -> AssessorResult<String> {
        self.generate(Stage::Manager, &agents.manager, text).await
    }

    async fn answer_from_knowledge(&self, agents: &SessionAgents, text: &str) -> AssessorResult<String> {
        let hits = self
            .bounded(
                Stage::Retrieval,
                self.retriever.search(text, self.settings.retrieval_k),
                |e| AssessorError::at_stage(Stage::Retrieval, e),
            )
            .await?;
        debug!("Retrieved {} document(s)", hits.len());
        self.generate(Stage::Knowledge, &agents.knowledge, &prompts::knowledge_input(text, &hits))
            .await
    }

    async fn fuse(&self, agents: &SessionAgents, content: &str, origin: OriginLabel) -> AssessorResult<DispatchOutcome> {
        let payload = prompts::fusion_input(content, &origin.fusion_tag());
        let text = self.generate(Stage::Fusion, &agents.router, &payload).await?;
        Ok(DispatchOutcome::new(text, origin))
    }

    /// Run the full protocol for one message
    pub async fn handle(&self, session_id: &str, message: &str) -> AssessorResult<DispatchOutcome> {
        let message = message.trim();
        if message.is_empty() {
            return Err(AssessorError::InvalidInput("message is empty".to_string()));
        }

        let agents = self.agents(session_id);
        let memories = self.load_memories(session_id).await;
        let raw = self
            .bounded(
                Stage::Router,
                agents.router.generate(&prompts::router_input(&memories, message)),
                |e| AssessorError::RouterUnavailable(e.to_string()),
            )
            .await?;

        let decision = match parse_router_output(&raw).map_err(|e| AssessorError::InvalidRoute(e.to_string()))? {
            RouterOutput::Direct(text) => {
                info!("Router answered directly for session {}", session_id);
                return Ok(DispatchOutcome::new(text, OriginLabel::Assistente));
            }
            RouterOutput::Routed(decision) => decision,
        };

        info!("Route {:?} for session {}", decision.route, session_id);
        self.dispatch(&agents, session_id, &decision).await
    }

    async fn dispatch(
        &self,
        agents: &SessionAgents,
        session_id: &str,
        decision: &RoutingDecision,
    ) -> AssessorResult<DispatchOutcome> {
        let text = decision.forwarded.as_str();

        match decision.route {
            Route::ManagerWithMemory => {
                let (curated, managed) = tokio::join!(self.curate_best_effort(agents, text, session_id), self.manage(agents, text));
                let content = format!("{}\n{}", curated, managed?);
                self.fuse(agents, &content, OriginLabel::CuradoriaGerente).await
            }
            Route::KnowledgeWithMemory => {
                let (curated, answer) = tokio::join!(
                    self.curate_best_effort(agents, text, session_id),
                    self.answer_from_knowledge(agents, text)
                );
                let content = format!("{}\n{}", curated, answer?);
                self.fuse(agents, &content, OriginLabel::CuradoriaRag).await
            }
            Route::Knowledge => {
                let answer = self.answer_from_knowledge(agents, text).await?;
                let verdict = self
                    .generate(
                        Stage::Evaluator,
                        &self.evaluator,
                        &prompts::evaluator_input(decision.question_or_forwarded(), &answer),
                    )
                    .await?;
                let content = format!("{}\nAvaliação: {}", answer, verdict);
                self.fuse(agents, &content, OriginLabel::Rag).await
            }
            Route::Manager => {
                let managed = self.manage(agents, text).await?;
                self.fuse(agents, &managed, OriginLabel::Gerente).await
            }
            Route::Memory => {
                let curated = self.curate(agents, text, session_id).await?;
                let reply = if curated.is_empty() {
                    self.settings.memory_ack.clone()
                } else {
                    curated
                };
                Ok(DispatchOutcome::new(reply, OriginLabel::Curadoria))
            }
            Route::OutOfScope => Ok(DispatchOutcome::new(
                self.settings.out_of_scope_reply.clone(),
                OriginLabel::ForaEscopo,
            )),
        }
    }

    /// Like [`Dispatcher::handle`], but failures become the error payload
    pub async fn handle_or_error(&self, session_id: &str, message: &str) -> DispatchOutcome {
        match self.handle(session_id, message).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Dispatch failed for session {}: {}", session_id, e);
                DispatchOutcome::error_payload(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::scripted::{ScriptedProvider, ScriptedTurn};
    use assessor_knowledge::{
        Embedder, KnowledgeDb, MemoryRecord, MemoryStoreError, QaPair, SqliteMemoryStore, TaskFilter,
    };
    use async_trait::async_trait;
    use crate::prompts::{CURATOR_PERSONA, EVALUATOR_PERSONA, KNOWLEDGE_PERSONA, MANAGER_PERSONA, ROUTER_PERSONA};
    use serde_json::{Value, json};

    /// Bag-of-keywords embedder, enough for stable rankings
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            const WORDS: [&str; 4] = ["floculação", "cloro", "filtro", "coagulante"];
            Ok(texts
                .iter()
                .map(|t| {
                    let lower = t.to_lowercase();
                    let mut v: Vec<f32> = WORDS.iter().map(|w| lower.matches(w).count() as f32).collect();
                    v.push(0.1);
                    v
                })
                .collect())
        }
    }

    struct DownMemoryStore;

    #[async_trait]
    impl MemoryStore for DownMemoryStore {
        async fn append(&self, _: &str, _: Value) -> Result<MemoryRecord, MemoryStoreError> {
            Err(MemoryStoreError::Unavailable("connection refused".into()))
        }
        async fn pop_last(&self, _: &str) -> Result<Option<MemoryRecord>, MemoryStoreError> {
            Err(MemoryStoreError::Unavailable("connection refused".into()))
        }
        async fn list_all(&self, _: &str) -> Result<Vec<MemoryRecord>, MemoryStoreError> {
            Err(MemoryStoreError::Unavailable("connection refused".into()))
        }
    }

    struct Fixture {
        provider: Arc<ScriptedProvider>,
        dispatcher: Dispatcher,
        ledger: Ledger,
        memory: Arc<dyn MemoryStore>,
        histories: Arc<HistoryStore>,
        session_id: String,
    }

    async fn fixture_with(provider: ScriptedProvider, memory: Option<Arc<dyn MemoryStore>>, timeout: u64) -> Fixture {
        let db = KnowledgeDb::open_in_memory().unwrap();
        let ledger = Ledger::new(db.clone());
        let id = ledger.add_employee("Ana Souza", "ana@example.com").await.unwrap();
        let memory = memory.unwrap_or_else(|| Arc::new(SqliteMemoryStore::new(db.clone())));
        let retriever = KnowledgeRetriever::new(db, Arc::new(KeywordEmbedder));
        retriever
            .ingest(vec![
                QaPair {
                    question: "O que é floculação?".into(),
                    answer: "Etapa em que partículas se aglutinam em flocos.".into(),
                },
                QaPair {
                    question: "Para que serve o cloro?".into(),
                    answer: "Desinfecção.".into(),
                },
                QaPair {
                    question: "Qual coagulante usar antes da floculação?".into(),
                    answer: "Sulfato de alumínio é o mais comum.".into(),
                },
                QaPair {
                    question: "Como lavar o filtro?".into(),
                    answer: "Retrolavagem.".into(),
                },
            ])
            .await
            .unwrap();

        let provider = Arc::new(provider);
        let backends = Backends {
            main: provider.clone(),
            flash: provider.clone(),
        };
        let histories = Arc::new(HistoryStore::new());
        let services = Services {
            ledger: ledger.clone(),
            memory: memory.clone(),
            retriever,
            histories: histories.clone(),
        };
        let settings = DispatchSettings {
            call_timeout_secs: timeout,
            ..Default::default()
        };
        Fixture {
            provider,
            dispatcher: Dispatcher::new(backends, services, settings),
            ledger,
            memory,
            histories,
            session_id: id.to_string(),
        }
    }

    async fn fixture(provider: ScriptedProvider) -> Fixture {
        fixture_with(provider, None, 30).await
    }

    #[tokio::test]
    async fn test_direct_answer_returned_verbatim() {
        let raw = "Olá! Posso registrar algo, buscar uma informação ou guardar algo importante?";
        let f = fixture(ScriptedProvider::new().on(ROUTER_PERSONA, vec![ScriptedTurn::text(raw)])).await;

        let outcome = f.dispatcher.handle(&f.session_id, "Oi, tudo bem?").await.unwrap();
        assert_eq!(outcome, DispatchOutcome::new(raw, OriginLabel::Assistente));
        assert_eq!(f.provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_manager_with_memory_route() {
        let message = "Lembre que mudei de área para Tratamento, e agende revisão de relatórios até sexta";
        let provider = ScriptedProvider::new()
            .on(
                ROUTER_PERSONA,
                vec![
                    ScriptedTurn::text(format!(
                        "ROUTE=gerente,memoria\nPERGUNTA_ORIGINAL={}\nCLARIFY=",
                        message
                    )),
                    ScriptedTurn::text("Pronto! Anotei sua mudança para Tratamento e agendei a revisão para sexta."),
                ],
            )
            .on(
                CURATOR_PERSONA,
                vec![
                    ScriptedTurn::tool_call(
                        "record_memory",
                        json!({"content": "Mudou de área para Tratamento"}),
                    ),
                    ScriptedTurn::text(""),
                ],
            )
            .on(
                MANAGER_PERSONA,
                vec![
                    ScriptedTurn::tool_call(
                        "create_task",
                        json!({"description": "Revisão de relatórios até sexta", "priority": "Média", "employee": "ana@example.com"}),
                    ),
                    ScriptedTurn::text("Executando… ✅ Tarefa registrada: revisão de relatórios até sexta."),
                ],
            );
        let f = fixture(provider).await;

        let outcome = f.dispatcher.handle(&f.session_id, message).await.unwrap();
        assert_eq!(outcome.origin, OriginLabel::CuradoriaGerente);
        assert!(outcome.text.contains("agendei a revisão"));

        assert_eq!(f.ledger.list_tasks(TaskFilter::default()).await.unwrap().len(), 1);
        assert_eq!(f.memory.list_all(&f.session_id).await.unwrap().len(), 1);

        let curator_input = f.provider.calls_for(CURATOR_PERSONA)[0].last_input();
        assert!(curator_input.ends_with(&format!("SessionID:{}", f.session_id)));
        assert!(!curator_input.contains("ROUTE="));

        let router_calls = f.provider.calls_for(ROUTER_PERSONA);
        assert_eq!(router_calls.len(), 2);
        let fusion = router_calls[1].last_input();
        assert!(fusion.starts_with("RESPOSTA_FINAL="));
        assert!(fusion.contains("Tarefa registrada"));
        assert!(fusion.ends_with("ORIGEM=curadoria_gerente"));
    }

    #[tokio::test]
    async fn test_knowledge_route_runs_evaluator() {
        let provider = ScriptedProvider::new()
            .on(
                ROUTER_PERSONA,
                vec![
                    ScriptedTurn::text("ROUTE=rag\nPERGUNTA_ORIGINAL=O que é floculação?\nCLARIFY="),
                    ScriptedTurn::text("Floculação é a etapa em que as partículas se juntam em flocos."),
                ],
            )
            .on(
                KNOWLEDGE_PERSONA,
                vec![ScriptedTurn::text(
                    "RESPOSTA_FINAL=Etapa em que partículas se aglutinam em flocos.\nFONTES_RESUMIDAS=O que é floculação?",
                )],
            )
            .on(EVALUATOR_PERSONA, vec![ScriptedTurn::text("CORRETA")]);
        let f = fixture(provider).await;

        let outcome = f.dispatcher.handle(&f.session_id, "O que é floculação?").await.unwrap();
        assert_eq!(outcome.origin, OriginLabel::Rag);

        let knowledge_input = f.provider.calls_for(KNOWLEDGE_PERSONA)[0].last_input();
        assert!(knowledge_input.contains("1. question: O que é floculação?"));
        assert!(!knowledge_input.contains("4. question"));

        let evaluator_input = f.provider.calls_for(EVALUATOR_PERSONA)[0].last_input();
        assert!(evaluator_input.starts_with("Pergunta: O que é floculação?"));

        let fusion = f.provider.calls_for(ROUTER_PERSONA)[1].last_input();
        assert!(fusion.contains("Avaliação: CORRETA"));
        assert!(fusion.ends_with("ORIGEM=rag"));
        assert!(f.provider.calls_for(CURATOR_PERSONA).is_empty());
    }

    #[tokio::test]
    async fn test_knowledge_with_memory_route() {
        let provider = ScriptedProvider::new()
            .on(
                ROUTER_PERSONA,
                vec![
                    ScriptedTurn::text("ROUTE=rag,memoria\nPERGUNTA_ORIGINAL=Sou operador novo, o que é floculação?"),
                    ScriptedTurn::text("Bem-vindo! Floculação é a formação de flocos."),
                ],
            )
            .on(CURATOR_PERSONA, vec![ScriptedTurn::text("")])
            .on(KNOWLEDGE_PERSONA, vec![ScriptedTurn::text("Formação de flocos.")]);
        let f = fixture(provider).await;

        let outcome = f.dispatcher.handle(&f.session_id, "Sou operador novo, o que é floculação?").await.unwrap();
        assert_eq!(outcome.origin, OriginLabel::CuradoriaRag);
        assert!(f.provider.calls_for(EVALUATOR_PERSONA).is_empty());
        let fusion = f.provider.calls_for(ROUTER_PERSONA)[1].last_input();
        assert!(fusion.ends_with("ORIGEM=curadoria_rag"));
    }

    #[tokio::test]
    async fn test_manager_only_skips_curator() {
        let provider = ScriptedProvider::new()
            .on(
                ROUTER_PERSONA,
                vec![
                    ScriptedTurn::text("ROUTE=gerente\nPERGUNTA_ORIGINAL=Quero ver todos os funcionários."),
                    ScriptedTurn::text("A equipe tem uma pessoa: Ana Souza."),
                ],
            )
            .on(
                MANAGER_PERSONA,
                vec![
                    ScriptedTurn::tool_call("list_employees", json!({})),
                    ScriptedTurn::text("Ana Souza (ana@example.com)"),
                ],
            );
        let f = fixture(provider).await;

        let outcome = f.dispatcher.handle(&f.session_id, "Quero ver todos os funcionários.").await.unwrap();
        assert_eq!(outcome.origin, OriginLabel::Gerente);
        assert!(f.provider.calls_for(CURATOR_PERSONA).is_empty());
        assert_eq!(
            f.provider.calls_for(ROUTER_PERSONA)[1].last_input(),
            "RESPOSTA_FINAL=Ana Souza (ana@example.com)\nORIGEM=gerente"
        );
    }

    #[tokio::test]
    async fn test_memory_only_silent_curator_gets_ack() {
        let provider = ScriptedProvider::new()
            .on(
                ROUTER_PERSONA,
                vec![ScriptedTurn::text("ROUTE=memoria\nPERGUNTA_ORIGINAL=Prefiro relatórios pela manhã.")],
            )
            .on(
                CURATOR_PERSONA,
                vec![
                    ScriptedTurn::tool_call(
                        "record_memory",
                        json!({"content": "Prefere relatórios pela manhã"}),
                    ),
                    ScriptedTurn::text(""),
                ],
            );
        let f = fixture(provider).await;

        let outcome = f.dispatcher.handle(&f.session_id, "Prefiro relatórios pela manhã.").await.unwrap();
        assert_eq!(outcome, DispatchOutcome::new(DispatchSettings::default().memory_ack, OriginLabel::Curadoria));
        // No fusion pass for memory-only routes
        assert_eq!(f.provider.calls_for(ROUTER_PERSONA).len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_scope_never_reaches_curator() {
        let provider = ScriptedProvider::new().on(
            ROUTER_PERSONA,
            vec![ScriptedTurn::text("ROUTE=fora_escopo\nPERGUNTA_ORIGINAL=Qual é o sentido da vida?")],
        );
        let f = fixture(provider).await;

        let outcome = f.dispatcher.handle(&f.session_id, "Qual é o sentido da vida?").await.unwrap();
        assert_eq!(outcome.origin, OriginLabel::ForaEscopo);
        assert_eq!(outcome.text, DispatchSettings::default().out_of_scope_reply);
        assert_eq!(f.provider.calls().len(), 1);
        assert!(f.memory.list_all(&f.session_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_route_rejected() {
        let provider = ScriptedProvider::new().on(ROUTER_PERSONA, vec![ScriptedTurn::text("ROUTE=gerente,rag")]);
        let f = fixture(provider).await;
        let err = f.dispatcher.handle(&f.session_id, "Faça tudo").await.unwrap_err();
        assert!(matches!(err, AssessorError::InvalidRoute(_)));
    }

    #[tokio::test]
    async fn test_router_failure_is_router_unavailable() {
        let provider = ScriptedProvider::new().on(ROUTER_PERSONA, vec![ScriptedTurn::fail("503 overloaded")]);
        let f = fixture(provider).await;

        let err = f.dispatcher.handle(&f.session_id, "Oi").await.unwrap_err();
        assert!(matches!(err, AssessorError::RouterUnavailable(_)));

        let payload = f.dispatcher.handle_or_error(&f.session_id, "Oi").await;
        assert_eq!(payload.origin, OriginLabel::Erro);
        assert!(payload.text.starts_with(ERROR_PREFIX));
    }

    #[tokio::test]
    async fn test_router_timeout() {
        let provider = ScriptedProvider::new().on(
            ROUTER_PERSONA,
            vec![ScriptedTurn::stall(Duration::from_secs(5), ScriptedTurn::text("tarde demais"))],
        );
        let f = fixture_with(provider, None, 1).await;

        let err = f.dispatcher.handle(&f.session_id, "Oi").await.unwrap_err();
        assert!(matches!(err, AssessorError::Timeout { stage: Stage::Router, .. }));
    }

    #[tokio::test]
    async fn test_curator_failure_does_not_fail_compound_route() {
        let provider = ScriptedProvider::new()
            .on(
                ROUTER_PERSONA,
                vec![
                    ScriptedTurn::text("ROUTE=gerente,memoria\nPERGUNTA_ORIGINAL=Liste as tarefas e lembre que sou supervisora"),
                    ScriptedTurn::text("Aqui estão suas tarefas."),
                ],
            )
            .on(CURATOR_PERSONA, vec![ScriptedTurn::fail("500 internal")])
            .on(MANAGER_PERSONA, vec![ScriptedTurn::text("Nenhuma tarefa encontrada.")]);
        let f = fixture(provider).await;

        let outcome = f
            .dispatcher
            .handle(&f.session_id, "Liste as tarefas e lembre que sou supervisora")
            .await
            .unwrap();
        assert_eq!(outcome.origin, OriginLabel::CuradoriaGerente);
    }

    #[tokio::test]
    async fn test_manager_failure_fails_compound_route() {
        let provider = ScriptedProvider::new()
            .on(
                ROUTER_PERSONA,
                vec![ScriptedTurn::text("ROUTE=gerente,memoria\nPERGUNTA_ORIGINAL=x")],
            )
            .on(CURATOR_PERSONA, vec![ScriptedTurn::text("")])
            .on(MANAGER_PERSONA, vec![ScriptedTurn::fail("500 internal")]);
        let f = fixture(provider).await;

        let err = f.dispatcher.handle(&f.session_id, "x").await.unwrap_err();
        assert!(matches!(err, AssessorError::GenericDispatchFailure(msg) if msg.starts_with("manager failed")));
    }

    #[tokio::test]
    async fn test_memory_outage_marks_router_input() {
        let provider = ScriptedProvider::new().on(ROUTER_PERSONA, vec![ScriptedTurn::text("Olá!")]);
        let f = fixture_with(provider, Some(Arc::new(DownMemoryStore)), 30).await;

        let outcome = f.dispatcher.handle(&f.session_id, "Oi").await.unwrap();
        assert_eq!(outcome.origin, OriginLabel::Assistente);
        let input = f.provider.calls()[0].last_input();
        assert!(input.contains(prompts::MEMORY_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_memories_included_in_router_input() {
        let provider = ScriptedProvider::new().on(ROUTER_PERSONA, vec![ScriptedTurn::text("Você trabalha no Tratamento.")]);
        let f = fixture(provider).await;
        f.memory
            .append(&f.session_id, json!("Trabalha na área de Tratamento"))
            .await
            .unwrap();

        f.dispatcher.handle(&f.session_id, "Em que área eu trabalho?").await.unwrap();
        let input = f.provider.calls()[0].last_input();
        assert!(input.contains("Trabalha na área de Tratamento"));
        assert!(input.ends_with("Mensagem:Em que área eu trabalho?"));
    }

    #[tokio::test]
    async fn test_sessions_do_not_share_history() {
        let provider = ScriptedProvider::new().on(
            ROUTER_PERSONA,
            vec![ScriptedTurn::text("Olá, Ana!"), ScriptedTurn::text("Olá, Bruno!")],
        );
        let f = fixture(provider).await;
        let bruno = f.ledger.add_employee("Bruno Lima", "bruno@example.com").await.unwrap().to_string();
        f.memory
            .append(&f.session_id, json!("Ana SEGREDO: prefere o turno da noite"))
            .await
            .unwrap();

        f.dispatcher.handle(&f.session_id, "Oi").await.unwrap();
        f.dispatcher.handle(&bruno, "Oi").await.unwrap();

        let router_calls = f.provider.calls_for(ROUTER_PERSONA);
        let shots = prompts::ROUTER_SHOTS.len() * 2;
        assert_eq!(router_calls[1].messages.len(), shots + 1);
        assert!(router_calls[1].messages.iter().all(|m| !m.text().contains("SEGREDO")));

        assert_eq!(f.histories.snapshot(&f.session_id, Channel::Router).await.len(), 2);
        let bruno_history = f.histories.snapshot(&bruno, Channel::Router).await;
        assert_eq!(bruno_history.len(), 2);
        assert!(bruno_history.iter().all(|e| !e.text.contains("SEGREDO")));
    }

    #[tokio::test]
    async fn test_concurrent_requests_serialize_on_channel() {
        let provider = ScriptedProvider::new().on(
            ROUTER_PERSONA,
            vec![
                ScriptedTurn::stall(Duration::from_millis(300), ScriptedTurn::text("Primeira resposta")),
                ScriptedTurn::text("Segunda resposta"),
            ],
        );
        let f = fixture(provider).await;

        let (first, second) = tokio::join!(
            f.dispatcher.handle(&f.session_id, "Oi"),
            f.dispatcher.handle(&f.session_id, "Tudo bem?")
        );
        first.unwrap();
        second.unwrap();

        let calls = f.provider.calls_for(ROUTER_PERSONA);
        let shots = prompts::ROUTER_SHOTS.len() * 2;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].messages.len(), shots + 1);
        // The later call sees the earlier exchange complete
        assert_eq!(calls[1].messages.len(), shots + 3);
        assert_eq!(calls[1].messages[shots].text(), calls[0].last_input());
        assert_eq!(calls[1].messages[shots + 1].text(), "Primeira resposta");

        let history = f.histories.snapshot(&f.session_id, Channel::Router).await;
        let texts: Vec<&str> = history.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts.len(), 4);
        assert_eq!(texts[1], "Primeira resposta");
        assert_eq!(texts[3], "Segunda resposta");
    }

    #[tokio::test]
    async fn test_compound_route_runs_curator_and_manager_together() {
        let stall = Duration::from_millis(500);
        let provider = ScriptedProvider::new()
            .on(
                ROUTER_PERSONA,
                vec![
                    ScriptedTurn::text("ROUTE=gerente,memoria\nPERGUNTA_ORIGINAL=Liste as tarefas, sou supervisora"),
                    ScriptedTurn::text("Nenhuma tarefa aberta."),
                ],
            )
            .on(CURATOR_PERSONA, vec![ScriptedTurn::stall(stall, ScriptedTurn::text(""))])
            .on(
                MANAGER_PERSONA,
                vec![ScriptedTurn::stall(stall, ScriptedTurn::text("Nenhuma tarefa encontrada."))],
            );
        let f = fixture(provider).await;

        let started = std::time::Instant::now();
        let outcome = f
            .dispatcher
            .handle(&f.session_id, "Liste as tarefas, sou supervisora")
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(outcome.origin, OriginLabel::CuradoriaGerente);
        assert_eq!(f.provider.calls_for(CURATOR_PERSONA).len(), 1);
        assert_eq!(f.provider.calls_for(MANAGER_PERSONA).len(), 1);
        assert!(elapsed < stall * 2, "curator and manager ran one after the other: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let f = fixture(ScriptedProvider::new()).await;
        let err = f.dispatcher.handle(&f.session_id, "   ").await.unwrap_err();
        assert!(matches!(err, AssessorError::InvalidInput(_)));
        assert!(f.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_session() {
        let f = fixture(ScriptedProvider::new()).await;
        let timeout = Duration::from_secs(5);
        assert_eq!(
            resolve_session(&f.ledger, "ANA@example.com", timeout).await.unwrap(),
            f.session_id
        );
        assert!(matches!(
            resolve_session(&f.ledger, "ghost@example.com", timeout).await,
            Err(AssessorError::SessionNotFound(_))
        ));
        assert!(matches!(
            resolve_session(&f.ledger, " ", timeout).await,
            Err(AssessorError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_origin_labels() {
        assert_eq!(OriginLabel::CuradoriaGerente.as_str(), "CURADORIA_GERENTE");
        assert_eq!(OriginLabel::CuradoriaRag.fusion_tag(), "curadoria_rag");
        assert_eq!(serde_json::to_value(OriginLabel::ForaEscopo).unwrap(), json!("FORA_ESCOPO"));
        let payload = serde_json::to_value(DispatchOutcome::new("oi", OriginLabel::Assistente)).unwrap();
        assert_eq!(payload, json!({"resposta": "oi", "origem": "ASSISTENTE"}));
    }
}
