use crate::domain::events::{event_types, EventBus};
use crate::domain::models::ToolResult;
use crate::domain::ports::Tool;
use async_trait::async_trait;
use chrono::{Datelike, Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const TIME_OUT_OF_RANGE: &str = "time out of range";

static CLOCK_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2}):(\d{2})$").expect("valid clock regex"));
static RELATIVE_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s+(\p{L}+)$").expect("valid relative regex"));

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Reminder {
    pub id: u64,
    pub title: String,
    pub description: Option<String>,
    pub due_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub notified: bool,
}

/// In-memory reminder list shared by the tool and the watcher.
#[derive(Default)]
pub struct ReminderStore {
    reminders: Mutex<Vec<Reminder>>,
    next_id: AtomicU64,
}

impl ReminderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, title: &str, description: Option<String>, due_at: NaiveDateTime, now: NaiveDateTime) -> Reminder {
        let reminder = Reminder {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            title: title.to_string(),
            description,
            due_at,
            created_at: now,
            notified: false,
        };
        self.reminders.lock().push(reminder.clone());
        reminder
    }

    /// Marks every pending reminder due at or before `now` as notified and
    /// returns them.
    pub fn take_due(&self, now: NaiveDateTime) -> Vec<Reminder> {
        let mut reminders = self.reminders.lock();
        reminders
            .iter_mut()
            .filter(|r| !r.notified && r.due_at <= now)
            .map(|r| {
                r.notified = true;
                r.clone()
            })
            .collect()
    }

    pub fn active(&self) -> Vec<Reminder> {
        self.reminders.lock().iter().filter(|r| !r.notified).cloned().collect()
    }

    pub fn all(&self) -> Vec<Reminder> {
        self.reminders.lock().clone()
    }

    /// Drops notified reminders, returning how many were removed.
    pub fn clear_notified(&self) -> usize {
        let mut reminders = self.reminders.lock();
        let before = reminders.len();
        reminders.retain(|r| !r.notified);
        before - reminders.len()
    }
}

fn parse_weekday(name: &str) -> Option<Weekday> {
    let day = match name {
        "monday" | "lunes" => Weekday::Mon,
        "tuesday" | "martes" => Weekday::Tue,
        "wednesday" | "miércoles" | "miercoles" => Weekday::Wed,
        "thursday" | "jueves" => Weekday::Thu,
        "friday" | "viernes" => Weekday::Fri,
        "saturday" | "sábado" | "sabado" => Weekday::Sat,
        "sunday" | "domingo" => Weekday::Sun,
        _ => return None,
    };
    Some(day)
}

fn parse_date(text: &str, today: NaiveDate) -> Result<NaiveDate, String> {
    let lowered = text.trim().to_lowercase();
    match lowered.as_str() {
        "today" | "hoy" => return Ok(today),
        "tomorrow" | "mañana" | "manana" => return Ok(today + ChronoDuration::days(1)),
        _ => {}
    }

    if let Some(target) = parse_weekday(&lowered) {
        let current = today.weekday().num_days_from_monday() as i64;
        let wanted = target.num_days_from_monday() as i64;
        // The same weekday means next week.
        let ahead = match (wanted - current).rem_euclid(7) {
            0 => 7,
            n => n,
        };
        return Ok(today + ChronoDuration::days(ahead));
    }

    NaiveDate::parse_from_str(&lowered, "%Y-%m-%d").map_err(|_| format!("unrecognized date '{}'", text))
}

fn relative_offset(amount: i64, unit: &str) -> Result<ChronoDuration, String> {
    let offset = match unit.trim_end_matches('s') {
        "minute" | "minuto" | "min" => ChronoDuration::try_minutes(amount),
        "hour" | "hora" => ChronoDuration::try_hours(amount),
        "day" | "día" | "dia" => ChronoDuration::try_days(amount),
        other => return Err(format!("unknown time unit '{}'", other)),
    };
    offset.ok_or_else(|| TIME_OUT_OF_RANGE.to_string())
}

/// Resolves a reminder's `time` and optional `date` against `now`.
///
/// A relative time ("5 minutes", "1 hora") ignores `date`. A clock time that
/// has already passed today rolls over to tomorrow when no date was given.
pub fn parse_when(time: &str, date: Option<&str>, now: NaiveDateTime) -> Result<NaiveDateTime, String> {
    let time = time.trim().to_lowercase();

    if let Some(caps) = RELATIVE_TIME.captures(&time) {
        let amount: i64 = caps[1]
            .parse()
            .map_err(|_| format!("invalid amount in '{}'", time))?;
        let offset = relative_offset(amount, &caps[2])?;
        return now
            .checked_add_signed(offset)
            .ok_or_else(|| TIME_OUT_OF_RANGE.to_string());
    }

    let caps = CLOCK_TIME
        .captures(&time)
        .ok_or_else(|| format!("unrecognized time '{}'", time))?;
    let hour: u32 = caps[1].parse().map_err(|_| format!("invalid hour in '{}'", time))?;
    let minute: u32 = caps[2].parse().map_err(|_| format!("invalid minute in '{}'", time))?;
    let clock = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| format!("invalid time '{}'", time))?;

    let date = date.map(str::trim).filter(|d| !d.is_empty());
    match date {
        Some(d) => Ok(parse_date(d, now.date())?.and_time(clock)),
        None => {
            let today = now.date().and_time(clock);
            if today < now {
                Ok(today + ChronoDuration::days(1))
            } else {
                Ok(today)
            }
        }
    }
}

pub struct CreateReminderTool {
    store: Arc<ReminderStore>,
}

impl CreateReminderTool {
    pub fn new(store: Arc<ReminderStore>) -> Self {
        Self { store }
    }

    fn create(&self, input: &Value, now: NaiveDateTime) -> ToolResult {
        let title = input
            .get("title")
            .and_then(|v| v.as_str())
            .filter(|t| !t.trim().is_empty())
            .ok_or("Missing 'title' parameter")?;
        let time = input
            .get("time")
            .and_then(|v| v.as_str())
            .ok_or("Missing 'time' parameter")?;
        let date = input.get("date").and_then(|v| v.as_str());
        let description = input
            .get("description")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let due_at = parse_when(time, date, now)?;
        let reminder = self.store.add(title, description, due_at, now);
        info!(id = reminder.id, title = %reminder.title, due_at = %reminder.due_at, "Reminder created");

        Ok(json!({
            "id": reminder.id,
            "title": reminder.title,
            "date": due_at.format("%Y-%m-%d").to_string(),
            "time": due_at.format("%H:%M").to_string(),
            "description": reminder.description,
            "message": format!(
                "Reminder '{}' set for {} at {}.",
                reminder.title,
                due_at.format("%d/%m/%Y"),
                due_at.format("%H:%M")
            ),
        }))
    }
}

#[async_trait]
impl Tool for CreateReminderTool {
    fn name(&self) -> &str {
        "create_reminder"
    }

    fn schema(&self) -> Value {
        json!({
            "name": "create_reminder",
            "description": "Create a reminder for the user at a given time.",
            "parameters": {
                "type": "object",
                "properties": {
                    "title": {
                        "type": "string",
                        "description": "Short title of the reminder"
                    },
                    "time": {
                        "type": "string",
                        "description": "Clock time as HH:MM, or a relative amount such as '5 minutes' or '1 hour'"
                    },
                    "date": {
                        "type": "string",
                        "description": "YYYY-MM-DD, a weekday name, 'today' or 'tomorrow'"
                    },
                    "description": {
                        "type": "string",
                        "description": "Optional longer description"
                    }
                },
                "required": ["title", "time"]
            }
        })
    }

    async fn execute(&self, input: Value) -> ToolResult {
        self.create(&input, Local::now().naive_local())
    }
}

/// Publishes `reminder_due` for each reminder as it falls due, checking every
/// `interval`. Abort the returned handle to stop it.
pub fn spawn_reminder_watcher(store: Arc<ReminderStore>, bus: Arc<EventBus>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let due = store.take_due(Local::now().naive_local());
            if due.is_empty() {
                continue;
            }
            debug!(count = due.len(), "Reminders due");
            for reminder in due {
                bus.publish(
                    event_types::REMINDER_DUE,
                    json!({
                        "id": reminder.id,
                        "title": reminder.title,
                        "description": reminder.description.unwrap_or_default(),
                        "due_at": reminder.due_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
                    }),
                );
            }
        }
    })
}
