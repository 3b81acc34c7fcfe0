//! Task, alert and employee tools for the manager generator

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use assessor_knowledge::{Ledger, NewAlert, NewTask, TaskFilter};

use super::{ToolHandler, ToolRegistry, json_schema, optional_str, required_str};

/// Register every ledger tool on `registry`
pub fn register_ledger_tools(registry: &mut ToolRegistry, ledger: &Ledger) {
    registry.register(Arc::new(CheckAlertsTool::new(ledger.clone())));
    registry.register(Arc::new(CreateTaskTool::new(ledger.clone())));
    registry.register(Arc::new(AddAlertTool::new(ledger.clone())));
    registry.register(Arc::new(ListEmployeesTool::new(ledger.clone())));
    registry.register(Arc::new(ListTasksTool::new(ledger.clone())));
    registry.register(Arc::new(CompleteTaskTool::new(ledger.clone())));
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).context("Failed to serialize result")
}

fn parse_day(input: &Value, key: &str) -> Result<Option<NaiveDate>> {
    optional_str(input, key)
        .map(|s| {
            NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map_err(|_| anyhow!("Invalid '{}' date '{}', expected YYYY-MM-DD", key, s))
        })
        .transpose()
}

/// List active alerts, optionally including resolved ones
pub struct CheckAlertsTool {
    ledger: Ledger,
}

impl CheckAlertsTool {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl ToolHandler for CheckAlertsTool {
    fn name(&self) -> &str {
        "check_alerts"
    }

    fn description(&self) -> &str {
        "List station alerts, newest first. Only unresolved alerts unless include_resolved is true."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            json!({
                "include_resolved": {
                    "type": "boolean",
                    "description": "Also return alerts already marked as concluded"
                }
            }),
            vec![],
        )
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let include_resolved = input
            .get("include_resolved")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let alerts = self.ledger.list_alerts(include_resolved).await?;
        if alerts.is_empty() {
            return Ok("Nenhum aviso encontrado.".to_string());
        }
        to_json(&alerts)
    }
}

/// Create a task assigned to an employee
pub struct CreateTaskTool {
    ledger: Ledger,
}

impl CreateTaskTool {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl ToolHandler for CreateTaskTool {
    fn name(&self) -> &str {
        "create_task"
    }

    fn description(&self) -> &str {
        "Create a task. Meetings are also recorded as tasks. The employee is identified by email."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            json!({
                "description": {
                    "type": "string",
                    "description": "What has to be done, including any deadline"
                },
                "priority": {
                    "type": "string",
                    "description": "Priority level: Alta, Média or Baixa"
                },
                "employee": {
                    "type": "string",
                    "description": "Email of the responsible employee"
                },
                "status": {
                    "type": "string",
                    "description": "Optional status: pendente, andamento or concluida (default pendente)"
                }
            }),
            vec!["description", "priority", "employee"],
        )
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let task = NewTask {
            description: required_str(&input, "description")?.to_string(),
            priority: required_str(&input, "priority")?.to_string(),
            employee_email: required_str(&input, "employee")?.to_string(),
            status: optional_str(&input, "status"),
        };
        debug!("Creating task: {}", task.description);
        let record = self.ledger.create_task(task).await?;
        Ok(format!(
            "Tarefa {} criada para {} (prioridade {}, status {})",
            record.id, record.employee_email, record.priority, record.status
        ))
    }
}

/// Raise an alert against a treatment station
pub struct AddAlertTool {
    ledger: Ledger,
}

impl AddAlertTool {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl ToolHandler for AddAlertTool {
    fn name(&self) -> &str {
        "add_alert"
    }

    fn description(&self) -> &str {
        "Register an alert (occurrence, failure, inspection finding) for a treatment station."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            json!({
                "description": {
                    "type": "string",
                    "description": "What happened"
                },
                "station_id": {
                    "type": "integer",
                    "description": "Numeric id of the treatment station (ETA)"
                },
                "priority": {
                    "type": "string",
                    "description": "Priority level: Alta, Média or Baixa"
                },
                "status": {
                    "type": "string",
                    "description": "Optional status: pendente, andamento or concluida (default pendente)"
                }
            }),
            vec!["description", "station_id", "priority"],
        )
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let station_id = input
            .get("station_id")
            .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
            .ok_or_else(|| anyhow!("Missing 'station_id' parameter"))?;
        let alert = NewAlert {
            description: required_str(&input, "description")?.to_string(),
            station_id,
            priority: required_str(&input, "priority")?.to_string(),
            status: optional_str(&input, "status"),
        };
        let record = self.ledger.create_alert(alert).await?;
        Ok(format!(
            "Aviso {} registrado para a ETA {} (prioridade {})",
            record.id, record.station_id, record.priority
        ))
    }
}

/// List employees, optionally with their tasks
pub struct ListEmployeesTool {
    ledger: Ledger,
}

impl ListEmployeesTool {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl ToolHandler for ListEmployeesTool {
    fn name(&self) -> &str {
        "list_employees"
    }

    fn description(&self) -> &str {
        "List all employees with their emails, optionally including each one's tasks."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            json!({
                "include_tasks": {
                    "type": "boolean",
                    "description": "Attach the tasks of each employee"
                }
            }),
            vec![],
        )
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let include_tasks = input.get("include_tasks").and_then(|v| v.as_bool()).unwrap_or(false);
        let employees = self.ledger.list_employees(include_tasks).await?;
        if employees.is_empty() {
            return Ok("Nenhum funcionário cadastrado.".to_string());
        }
        to_json(&employees)
    }
}

/// Search tasks by any combination of filters
pub struct ListTasksTool {
    ledger: Ledger,
}

impl ListTasksTool {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl ToolHandler for ListTasksTool {
    fn name(&self) -> &str {
        "list_tasks"
    }

    fn description(&self) -> &str {
        "List tasks. Every filter is optional; text filters match substrings, dates are YYYY-MM-DD."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            json!({
                "description": {"type": "string", "description": "Part of the task description"},
                "email": {"type": "string", "description": "Part of the responsible employee's email"},
                "created_on": {"type": "string", "description": "Creation date, YYYY-MM-DD"},
                "completed_on": {"type": "string", "description": "Completion date, YYYY-MM-DD"},
                "priority": {"type": "string", "description": "Priority level"}
            }),
            vec![],
        )
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let filter = TaskFilter {
            description: optional_str(&input, "description"),
            email: optional_str(&input, "email"),
            created_on: parse_day(&input, "created_on")?,
            completed_on: parse_day(&input, "completed_on")?,
            priority: optional_str(&input, "priority"),
        };
        let tasks = self.ledger.list_tasks(filter).await?;
        if tasks.is_empty() {
            return Ok("Nenhuma tarefa encontrada.".to_string());
        }
        to_json(&tasks)
    }
}

/// Mark matching open tasks of an employee as concluded
pub struct CompleteTaskTool {
    ledger: Ledger,
}

impl CompleteTaskTool {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl ToolHandler for CompleteTaskTool {
    fn name(&self) -> &str {
        "complete_task"
    }

    fn description(&self) -> &str {
        "Conclude the open tasks of an employee whose description contains the given text."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            json!({
                "description": {"type": "string", "description": "Part of the task description"},
                "employee_email": {"type": "string", "description": "Email of the responsible employee"}
            }),
            vec!["description", "employee_email"],
        )
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let description = required_str(&input, "description")?;
        let email = required_str(&input, "employee_email")?;
        let affected = self.ledger.complete_task(description, email).await?;
        if affected == 0 {
            return Ok(format!("Nenhuma tarefa em aberto de {} corresponde a '{}'.", email, description));
        }
        Ok(format!("{} tarefa(s) concluída(s).", affected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolExecutor;
    use assessor_knowledge::KnowledgeDb;

    async fn setup() -> (ToolRegistry, Ledger) {
        let ledger = Ledger::new(KnowledgeDb::open_in_memory().unwrap());
        ledger.add_employee("Ana Souza", "ana@example.com").await.unwrap();
        let mut registry = ToolRegistry::new();
        register_ledger_tools(&mut registry, &ledger);
        (registry, ledger)
    }

    #[tokio::test]
    async fn test_all_tools_registered() {
        let (registry, _) = setup().await;
        let names: Vec<_> = registry.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec!["add_alert", "check_alerts", "complete_task", "create_task", "list_employees", "list_tasks"]
        );
    }

    #[tokio::test]
    async fn test_create_then_complete_task() {
        let (registry, ledger) = setup().await;
        let out = registry
            .execute(
                "create_task",
                json!({"description": "Revisar relatórios até sexta", "priority": "média", "employee": "ana@example.com"}),
            )
            .await
            .unwrap();
        assert!(out.contains("prioridade Média"));
        assert_eq!(ledger.list_tasks(TaskFilter::default()).await.unwrap().len(), 1);

        let out = registry
            .execute(
                "complete_task",
                json!({"description": "relatórios", "employee_email": "ana@example.com"}),
            )
            .await
            .unwrap();
        assert_eq!(out, "1 tarefa(s) concluída(s).");

        let out = registry
            .execute(
                "complete_task",
                json!({"description": "relatórios", "employee_email": "ana@example.com"}),
            )
            .await
            .unwrap();
        assert!(out.starts_with("Nenhuma tarefa em aberto"));
    }

    #[tokio::test]
    async fn test_unknown_reference_is_error() {
        let (registry, _) = setup().await;
        let err = registry
            .execute(
                "create_task",
                json!({"description": "x", "priority": "Urgentíssima", "employee": "ana@example.com"}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Urgentíssima"));
    }

    #[tokio::test]
    async fn test_alert_station_as_string() {
        let (registry, _) = setup().await;
        registry
            .execute(
                "add_alert",
                json!({"description": "Ruído na bomba", "station_id": "3", "priority": "Alta"}),
            )
            .await
            .unwrap();
        let out = registry.execute("check_alerts", json!({})).await.unwrap();
        assert!(out.contains("Ruído na bomba"));
    }

    #[tokio::test]
    async fn test_list_tasks_rejects_bad_date() {
        let (registry, _) = setup().await;
        assert!(registry.execute("list_tasks", json!({"created_on": "sexta"})).await.is_err());
        let out = registry.execute("list_tasks", json!({})).await.unwrap();
        assert_eq!(out, "Nenhuma tarefa encontrada.");
    }
}
