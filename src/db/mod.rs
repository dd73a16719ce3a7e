use crate::delivery::{EmailSender, NotificationSurface};
use crate::errors::{AppError, AppResult};
use crate::models::{
    CreateTaskPayload, EmailOutboxRecord, NotificationOptions, NotificationPayload, NotificationRecord,
    PermissionState, ReminderNotice, ReminderSettings, Task, TaskFilter, UpdateTaskPayload,
};
use crate::poller::TaskSource;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const SETTINGS_KEY: &str = "reminders";
const PERMISSION_KEY: &str = "notification-permission";
const TASK_COLUMNS: &str =
    "id, title, description, deadline, completed, completed_at, alarm_json, version, created_at, updated_at";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        db.ensure_default_settings()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn insert_task(&self, payload: &CreateTaskPayload) -> AppResult<Task> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            title: payload.title.trim().to_string(),
            description: payload.description.clone(),
            deadline: payload.deadline,
            completed: false,
            completed_at: None,
            alarm: payload.alarm.clone(),
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tasks (
               id, title, description, deadline, completed, completed_at, alarm_json, alarm_enabled,
               version, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, 0, NULL, ?5, ?6, ?7, ?8, ?9)",
            params![
                task.id,
                task.title,
                task.description,
                task.deadline.map(format_time),
                alarm_json(&task)?,
                alarm_enabled(&task),
                task.version,
                format_time(task.created_at),
                format_time(task.updated_at),
            ],
        )?;
        Ok(task)
    }

    /// Applies a partial update and bumps the task version.
    pub fn update_task(&self, task_id: &str, payload: &UpdateTaskPayload) -> AppResult<Task> {
        let mut task = self
            .get_task(task_id)?
            .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))?;

        if let Some(title) = &payload.title {
            task.title = title.trim().to_string();
        }
        if let Some(description) = &payload.description {
            task.description = Some(description.clone()).filter(|value| !value.is_empty());
        }
        if payload.clear_deadline {
            task.deadline = None;
        } else if let Some(deadline) = payload.deadline {
            task.deadline = Some(deadline);
        }
        if let Some(alarm) = &payload.alarm {
            task.alarm = Some(alarm.clone());
        }
        self.write_task(task)
    }

    /// Marks a task complete or incomplete. Either way the version moves, so an
    /// un-completed task gets fresh reminders.
    pub fn set_task_completed(&self, task_id: &str, completed: bool) -> AppResult<Task> {
        let mut task = self
            .get_task(task_id)?
            .ok_or_else(|| AppError::NotFound(format!("Task {} not found", task_id)))?;
        if task.completed == completed {
            return Ok(task);
        }
        task.completed = completed;
        task.completed_at = if completed { Some(Utc::now()) } else { None };
        self.write_task(task)
    }

    fn write_task(&self, mut task: Task) -> AppResult<Task> {
        task.version += 1;
        task.updated_at = Utc::now();

        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE tasks
             SET title = ?2, description = ?3, deadline = ?4, completed = ?5, completed_at = ?6,
                 alarm_json = ?7, alarm_enabled = ?8, version = ?9, updated_at = ?10
             WHERE id = ?1 AND version = ?11",
            params![
                task.id,
                task.title,
                task.description,
                task.deadline.map(format_time),
                task.completed as i64,
                task.completed_at.map(format_time),
                alarm_json(&task)?,
                alarm_enabled(&task),
                task.version,
                format_time(task.updated_at),
                task.version - 1,
            ],
        )?;
        if changed == 0 {
            return Err(AppError::Internal(format!(
                "Task {} was modified concurrently",
                task.id
            )));
        }
        Ok(task)
    }

    pub fn delete_task(&self, task_id: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM tasks WHERE id = ?1", [task_id])?;
        Ok(changed > 0)
    }

    pub fn get_task(&self, task_id: &str) -> AppResult<Option<Task>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            [task_id],
            parse_task_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> AppResult<Vec<Task>> {
        let conn = self.lock()?;
        let mut query = format!("SELECT {} FROM tasks WHERE 1 = 1", TASK_COLUMNS);
        let mut params_vec: Vec<String> = Vec::new();

        if !filter.include_completed {
            query.push_str(" AND completed = 0");
        }

        let mut window = Vec::new();
        if let Some(due_after) = filter.due_after {
            window.push("deadline >= ?");
            params_vec.push(format_time(due_after));
        }
        if let Some(due_before) = filter.due_before {
            window.push("deadline <= ?");
            params_vec.push(format_time(due_before));
        }
        if !window.is_empty() {
            let deadline_clause = format!("(deadline IS NOT NULL AND {})", window.join(" AND "));
            if filter.include_alarm_enabled {
                query.push_str(&format!(" AND ({} OR alarm_enabled = 1)", deadline_clause));
            } else {
                query.push_str(&format!(" AND {}", deadline_clause));
            }
        }

        query.push_str(" ORDER BY deadline IS NULL, deadline ASC, created_at ASC");

        let mut statement = conn.prepare(&query)?;
        let rows = statement.query_map(rusqlite::params_from_iter(params_vec.iter()), parse_task_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn get_settings(&self) -> AppResult<ReminderSettings> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                [SETTINGS_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<ReminderSettings>(&raw).unwrap_or_default()),
            None => Ok(ReminderSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<ReminderSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: ReminderSettings =
            serde_json::from_value(merged).map_err(|error| AppError::InvalidInput(error.to_string()))?;

        self.put_setting(SETTINGS_KEY, &serde_json::to_string(&settings)?)?;
        Ok(settings)
    }

    pub fn get_permission_state(&self) -> AppResult<PermissionState> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                [PERMISSION_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(raw
            .and_then(|raw| serde_json::from_str::<PermissionState>(&raw).ok())
            .unwrap_or_default())
    }

    pub fn set_permission_state(&self, state: PermissionState) -> AppResult<()> {
        self.put_setting(PERMISSION_KEY, &serde_json::to_string(&state)?)
    }

    fn put_setting(&self, key: &str, value_json: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![key, value_json, format_time(Utc::now())],
        )?;
        Ok(())
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM settings WHERE key = ?1",
            [SETTINGS_KEY],
            |row| row.get(0),
        )?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES (?1, ?2, ?3)",
                params![
                    SETTINGS_KEY,
                    serde_json::to_string(&ReminderSettings::default())?,
                    format_time(Utc::now())
                ],
            )?;
        }
        Ok(())
    }

    pub fn record_notification(
        &self,
        notice: &ReminderNotice,
        options: &NotificationOptions,
    ) -> AppResult<NotificationRecord> {
        let record = NotificationRecord {
            id: Uuid::new_v4().to_string(),
            task_id: notice.key.task_id.clone(),
            rule_key: notice.key.to_string(),
            title: notice.title.clone(),
            body: notice.body.clone(),
            options: options.clone(),
            created_at: Utc::now(),
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO notifications (id, task_id, rule_key, title, body, options_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.task_id,
                record.rule_key,
                record.title,
                record.body,
                serde_json::to_string(&record.options)?,
                format_time(record.created_at),
            ],
        )?;
        Ok(record)
    }

    pub fn list_notifications(&self, task_id: Option<&str>) -> AppResult<Vec<NotificationRecord>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT id, task_id, rule_key, title, body, options_json, created_at
             FROM notifications
             WHERE ?1 IS NULL OR task_id = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = statement.query_map([task_id], |row| {
            let options_json: String = row.get(5)?;
            let created_at: String = row.get(6)?;
            Ok(NotificationRecord {
                id: row.get(0)?,
                task_id: row.get(1)?,
                rule_key: row.get(2)?,
                title: row.get(3)?,
                body: row.get(4)?,
                options: parse_json(5, &options_json)?,
                created_at: parse_time(&created_at)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn enqueue_email(&self, payload: &NotificationPayload) -> AppResult<EmailOutboxRecord> {
        let record = EmailOutboxRecord {
            id: Uuid::new_v4().to_string(),
            payload: payload.clone(),
            queued_at: Utc::now(),
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO email_outbox (id, task_id, payload_json, queued_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id,
                record.payload.task_id,
                serde_json::to_string(&record.payload)?,
                format_time(record.queued_at),
            ],
        )?;
        Ok(record)
    }

    pub fn list_email_outbox(&self) -> AppResult<Vec<EmailOutboxRecord>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT id, payload_json, queued_at FROM email_outbox ORDER BY queued_at ASC, rowid ASC",
        )?;
        let rows = statement.query_map([], |row| {
            let payload_json: String = row.get(1)?;
            let queued_at: String = row.get(2)?;
            Ok(EmailOutboxRecord {
                id: row.get(0)?,
                payload: parse_json(1, &payload_json)?,
                queued_at: parse_time(&queued_at)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

impl TaskSource for Database {
    fn list_tasks(&self, filter: &TaskFilter) -> AppResult<Vec<Task>> {
        Database::list_tasks(self, filter)
    }
}

impl NotificationSurface for Database {
    fn show(&self, notice: &ReminderNotice, options: &NotificationOptions) -> AppResult<()> {
        self.record_notification(notice, options).map(|_| ())
    }
}

impl EmailSender for Database {
    fn send(&self, payload: &NotificationPayload) -> AppResult<()> {
        self.enqueue_email(payload).map(|_| ())
    }
}

fn alarm_json(task: &Task) -> AppResult<Option<String>> {
    task.alarm
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(AppError::from)
}

fn alarm_enabled(task: &Task) -> i64 {
    task.alarm.as_ref().map(|alarm| alarm.enabled as i64).unwrap_or(0)
}

fn parse_task_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let deadline: Option<String> = row.get(3)?;
    let completed_at: Option<String> = row.get(5)?;
    let alarm: Option<String> = row.get(6)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        deadline: deadline.as_deref().map(parse_time).transpose()?,
        completed: row.get::<_, i64>(4)? != 0,
        completed_at: completed_at.as_deref().map(parse_time).transpose()?,
        alarm: alarm.as_deref().map(|raw| parse_json(6, raw)).transpose()?,
        version: row.get(7)?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}

/// Fixed-width UTC so stored timestamps compare correctly as text.
fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

fn parse_json<T: serde::de::DeserializeOwned>(column: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(error)))
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
