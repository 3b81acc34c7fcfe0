//! Task and alert ledger
//!
//! Tasks are assigned to employees, alerts are raised against a treatment
//! station. Both carry a priority level and a status, stored as foreign keys
//! into small lookup tables. Name lookups fail with
//! [`LedgerError::ReferenceNotFound`] instead of writing a dangling row.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::sqlite::{DbError, KnowledgeDb};

/// Status assigned to new tasks and alerts when none is given
pub const DEFAULT_STATUS: &str = "pendente";

/// Status that marks an alert as resolved
pub const RESOLVED_STATUS: &str = "concluida";

/// Which lookup a failed reference belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Priority,
    Status,
    Employee,
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Priority => write!(f, "priority"),
            Self::Status => write!(f, "status"),
            Self::Employee => write!(f, "employee"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{kind} '{value}' not found")]
    ReferenceNotFound { kind: ReferenceKind, value: String },

    #[error(transparent)]
    Storage(#[from] DbError),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(DbError::Sqlite(e))
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub description: String,
    pub priority: String,
    pub employee_email: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAlert {
    pub description: String,
    pub station_id: i64,
    pub priority: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub priority: String,
    pub status: String,
    pub employee_email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: i64,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
    pub station_id: i64,
    pub priority: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Employee {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskRecord>,
}

/// Optional filters for [`Ledger::list_tasks`]. All set filters must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Case-insensitive substring of the description
    pub description: Option<String>,
    /// Case-insensitive substring of the employee email
    pub email: Option<String>,
    pub created_on: Option<NaiveDate>,
    pub completed_on: Option<NaiveDate>,
    /// Case-insensitive substring of the priority level
    pub priority: Option<String>,
}

/// CRUD access to tasks, alerts and employees
#[derive(Debug, Clone)]
pub struct Ledger {
    db: KnowledgeDb,
}

const TASK_SELECT: &str = "SELECT t.id, t.description, t.created_at, t.completed_at, p.level, s.name, e.email
     FROM tasks t
     JOIN priorities p ON p.id = t.priority_id
     JOIN statuses s ON s.id = t.status_id
     JOIN employees e ON e.id = t.employee_id";

impl Ledger {
    pub fn new(db: KnowledgeDb) -> Self {
        Self { db }
    }

    /// Register an employee, returning its id
    pub async fn add_employee(&self, name: &str, email: &str) -> LedgerResult<i64> {
        let name = name.trim().to_owned();
        let email = email.trim().to_owned();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO employees (name, email) VALUES (?1, ?2)",
                    params![&name, &email],
                )?;
                let id = conn.last_insert_rowid();
                info!("Registered employee {} <{}> ({})", name, email, id);
                Ok(id)
            })
            .await
    }

    /// Resolve an employee email to its id
    pub async fn find_employee_id(&self, email: &str) -> LedgerResult<i64> {
        let email = email.to_owned();
        self.db.call(move |conn| employee_id(conn, &email)).await
    }

    pub async fn create_task(&self, task: NewTask) -> LedgerResult<TaskRecord> {
        self.db
            .call(move |conn| {
                let status = task.status.as_deref().unwrap_or(DEFAULT_STATUS);
                let priority_id = priority_id(conn, &task.priority)?;
                let status_id = status_id(conn, status)?;
                let employee_id = employee_id(conn, &task.employee_email)?;
                let now = Utc::now();

                conn.execute(
                    "INSERT INTO tasks (description, created_at, priority_id, employee_id, status_id)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![&task.description, now.to_rfc3339(), priority_id, employee_id, status_id],
                )?;
                let id = conn.last_insert_rowid();
                debug!("Created task {} for {}", id, task.employee_email);
                task_by_id(conn, id)
            })
            .await
    }

    pub async fn create_alert(&self, alert: NewAlert) -> LedgerResult<AlertRecord> {
        self.db
            .call(move |conn| {
                let status = alert.status.as_deref().unwrap_or(DEFAULT_STATUS);
                let priority_id = priority_id(conn, &alert.priority)?;
                let status_id = status_id(conn, status)?;
                let now = Utc::now();

                conn.execute(
                    "INSERT INTO alerts (description, occurred_at, station_id, priority_id, status_id)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![&alert.description, now.to_rfc3339(), alert.station_id, priority_id, status_id],
                )?;
                let id = conn.last_insert_rowid();
                debug!("Created alert {} for station {}", id, alert.station_id);

                Ok(AlertRecord {
                    id,
                    description: alert.description,
                    occurred_at: now,
                    station_id: alert.station_id,
                    priority: canonical_name(conn, "priorities", "level", priority_id)?,
                    status: canonical_name(conn, "statuses", "name", status_id)?,
                })
            })
            .await
    }

    /// Alerts ordered by occurrence, newest first. Resolved alerts are
    /// skipped unless `include_resolved` is set.
    pub async fn list_alerts(&self, include_resolved: bool) -> LedgerResult<Vec<AlertRecord>> {
        self.db
            .call(move |conn| {
                let mut sql = String::from(
                    "SELECT a.id, a.description, a.occurred_at, a.station_id, p.level, s.name
                     FROM alerts a
                     JOIN priorities p ON p.id = a.priority_id
                     JOIN statuses s ON s.id = a.status_id",
                );
                if !include_resolved {
                    sql.push_str(" WHERE s.name <> ?1");
                }
                sql.push_str(" ORDER BY a.occurred_at DESC, a.id DESC");

                let mut stmt = conn.prepare(&sql)?;
                let rows = if include_resolved {
                    stmt.query_map([], alert_from_row)?
                        .collect::<Result<Vec<_>, _>>()?
                } else {
                    stmt.query_map(params![RESOLVED_STATUS], alert_from_row)?
                        .collect::<Result<Vec<_>, _>>()?
                };
                Ok(rows)
            })
            .await
    }

    /// Tasks matching every set filter, newest first
    pub async fn list_tasks(&self, filter: TaskFilter) -> LedgerResult<Vec<TaskRecord>> {
        self.db
            .call(move |conn| {
                let mut clauses = Vec::new();
                let mut values: Vec<String> = Vec::new();

                if let Some(desc) = filter.description.filter(|s| !s.trim().is_empty()) {
                    values.push(like_pattern(&desc));
                    clauses.push(format!("t.description LIKE ?{}", values.len()));
                }
                if let Some(email) = filter.email.filter(|s| !s.trim().is_empty()) {
                    values.push(like_pattern(&email));
                    clauses.push(format!("e.email LIKE ?{}", values.len()));
                }
                if let Some(day) = filter.created_on {
                    values.push(day.to_string());
                    clauses.push(format!("substr(t.created_at, 1, 10) = ?{}", values.len()));
                }
                if let Some(day) = filter.completed_on {
                    values.push(day.to_string());
                    clauses.push(format!("substr(t.completed_at, 1, 10) = ?{}", values.len()));
                }
                if let Some(level) = filter.priority.filter(|s| !s.trim().is_empty()) {
                    values.push(like_pattern(&level));
                    clauses.push(format!("p.level LIKE ?{}", values.len()));
                }

                let mut sql = String::from(TASK_SELECT);
                if !clauses.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&clauses.join(" AND "));
                }
                sql.push_str(" ORDER BY t.created_at DESC, t.id DESC");

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(values.iter()), task_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// All employees ordered by name, optionally with their tasks attached
    pub async fn list_employees(&self, include_tasks: bool) -> LedgerResult<Vec<Employee>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT id, name, email FROM employees ORDER BY name, id")?;
                let mut employees = stmt
                    .query_map([], |row| {
                        Ok(Employee {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            email: row.get(2)?,
                            tasks: Vec::new(),
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                if include_tasks {
                    let sql = format!("{} WHERE t.employee_id = ?1 ORDER BY t.created_at DESC, t.id DESC", TASK_SELECT);
                    let mut task_stmt = conn.prepare(&sql)?;
                    for employee in &mut employees {
                        employee.tasks = task_stmt
                            .query_map(params![employee.id], task_from_row)?
                            .collect::<Result<Vec<_>, _>>()?;
                    }
                }

                Ok(employees)
            })
            .await
    }

    /// Mark open tasks of an employee whose description contains
    /// `description` as completed. Returns the number of tasks updated;
    /// zero means nothing matched.
    pub async fn complete_task(&self, description: &str, employee_email: &str) -> LedgerResult<usize> {
        let description = description.to_owned();
        let email = employee_email.to_owned();
        self.db
            .call(move |conn| {
                let employee_id = employee_id(conn, &email)?;
                let status_id = status_id(conn, RESOLVED_STATUS)?;
                let affected = conn.execute(
                    "UPDATE tasks SET completed_at = ?1, status_id = ?2
                     WHERE description LIKE ?3
                       AND employee_id = ?4
                       AND completed_at IS NULL",
                    params![Utc::now().to_rfc3339(), status_id, like_pattern(&description), employee_id],
                )?;
                debug!("Completed {} task(s) matching '{}' for {}", affected, description, email);
                Ok(affected)
            })
            .await
    }
}

fn like_pattern(s: &str) -> String {
    format!("%{}%", s.trim())
}

fn lookup_by_name(
    conn: &Connection,
    table: &str,
    column: &str,
    kind: ReferenceKind,
    value: &str,
) -> LedgerResult<i64> {
    let wanted = value.trim().to_lowercase();
    let mut stmt = conn.prepare(&format!("SELECT id, {} FROM {}", column, table))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .find(|(_, name)| name.to_lowercase() == wanted)
        .map(|(id, _)| id)
        .ok_or_else(|| LedgerError::ReferenceNotFound {
            kind,
            value: value.to_string(),
        })
}

fn priority_id(conn: &Connection, level: &str) -> LedgerResult<i64> {
    lookup_by_name(conn, "priorities", "level", ReferenceKind::Priority, level)
}

fn status_id(conn: &Connection, status: &str) -> LedgerResult<i64> {
    lookup_by_name(conn, "statuses", "name", ReferenceKind::Status, status)
}

fn employee_id(conn: &Connection, email: &str) -> LedgerResult<i64> {
    conn.query_row(
        "SELECT id FROM employees WHERE lower(email) = lower(?1)",
        params![email.trim()],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| LedgerError::ReferenceNotFound {
        kind: ReferenceKind::Employee,
        value: email.to_string(),
    })
}

fn canonical_name(conn: &Connection, table: &str, column: &str, id: i64) -> LedgerResult<String> {
    Ok(conn.query_row(
        &format!("SELECT {} FROM {} WHERE id = ?1", column, table),
        params![id],
        |row| row.get(0),
    )?)
}

fn task_by_id(conn: &Connection, id: i64) -> LedgerResult<TaskRecord> {
    let sql = format!("{} WHERE t.id = ?1", TASK_SELECT);
    Ok(conn.query_row(&sql, params![id], task_from_row)?)
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        id: row.get(0)?,
        description: row.get(1)?,
        created_at: parse_timestamp(row.get::<_, String>(2)?),
        completed_at: row.get::<_, Option<String>>(3)?.map(parse_timestamp),
        priority: row.get(4)?,
        status: row.get(5)?,
        employee_email: row.get(6)?,
    })
}

fn alert_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlertRecord> {
    Ok(AlertRecord {
        id: row.get(0)?,
        description: row.get(1)?,
        occurred_at: parse_timestamp(row.get::<_, String>(2)?),
        station_id: row.get(3)?,
        priority: row.get(4)?,
        status: row.get(5)?,
    })
}

fn parse_timestamp(s: String) -> DateTime<Utc> {
    s.parse().unwrap_or_else(|_| Utc::now())
}
