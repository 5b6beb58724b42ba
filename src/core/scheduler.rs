use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::ipc::protocol::CommandRequest;
use crate::photon::PhotonModule;

/// Five-field cron expression (`minute hour day-of-month month day-of-week`).
///
/// Each field accepts `*`, a number, a range `a-b`, a list `a,b,c` and a step
/// (`*/n` or `a-b/n`). `@hourly`, `@daily`, `@weekly`, `@monthly` and
/// `@yearly` are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Option<Vec<u32>>,
    months: Vec<u32>,
    days_of_week: Option<Vec<u32>>,
    raw: String,
}

impl CronSchedule {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let expanded = match trimmed {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            other => other,
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        if parts.len() != 5 {
            bail!("cron expression '{}' must have 5 fields", trimmed);
        }

        let minutes = parse_field(parts[0], 0, 59)?.unwrap_or_else(|| (0..=59).collect());
        let hours = parse_field(parts[1], 0, 23)?.unwrap_or_else(|| (0..=23).collect());
        let days_of_month = parse_field(parts[2], 1, 31)?;
        let months = parse_field(parts[3], 1, 12)?.unwrap_or_else(|| (1..=12).collect());
        // 7 is another spelling of Sunday
        let days_of_week = parse_field(parts[4], 0, 7)?.map(|days| {
            let mut days: Vec<u32> = days.into_iter().map(|d| d % 7).collect();
            days.sort_unstable();
            days.dedup();
            days
        });

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            raw: trimmed.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        if !self.minutes.contains(&at.minute())
            || !self.hours.contains(&at.hour())
            || !self.months.contains(&at.month())
        {
            return false;
        }

        let dom = self
            .days_of_month
            .as_ref()
            .map_or(true, |days| days.contains(&at.day()));
        let dow = self
            .days_of_week
            .as_ref()
            .map_or(true, |days| days.contains(&at.weekday().num_days_from_sunday()));

        // Classic cron: when both day fields are restricted, either may match
        match (self.days_of_month.is_some(), self.days_of_week.is_some()) {
            (true, true) => dom || dow,
            _ => dom && dow,
        }
    }
}

/// `None` means the field is unrestricted (`*`)
fn parse_field(raw: &str, min: u32, max: u32) -> Result<Option<Vec<u32>>> {
    if raw == "*" {
        return Ok(None);
    }

    let mut values = Vec::new();
    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| anyhow!("invalid cron step '{}'", part))?;
                if step == 0 {
                    bail!("cron step must be positive in '{}'", part);
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, min, max)?, parse_value(b, min, max)?)
        } else {
            let value = parse_value(range, min, max)?;
            // "5/15" runs from 5 to the end of the range
            if step > 1 {
                (value, max)
            } else {
                (value, value)
            }
        };
        if start > end {
            bail!("invalid cron range '{}'", range);
        }
        values.extend((start..=end).step_by(step as usize));
    }

    values.sort_unstable();
    values.dedup();
    Ok(Some(values))
}

fn parse_value(raw: &str, min: u32, max: u32) -> Result<u32> {
    let value: u32 = raw
        .parse()
        .map_err(|_| anyhow!("invalid cron field '{}'", raw))?;
    if value < min || value > max {
        bail!("cron field '{}' out of range ({}-{})", raw, min, max);
    }
    Ok(value)
}

/// Where a job came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    /// Declared by a method's `scheduled` capability; follows reloads
    Descriptor,
    /// Registered through a `schedule` request
    Client,
}

#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: String,
    pub photon: String,
    pub photon_path: Option<PathBuf>,
    pub method: String,
    pub args: Value,
    pub instance_name: Option<String>,
    pub cron: CronSchedule,
    pub source: JobSource,
    /// Minute stamp of the last firing, so one minute never fires twice
    last_fired: Option<i64>,
}

impl ScheduledJob {
    pub fn new(
        id: impl Into<String>,
        photon: impl Into<String>,
        method: impl Into<String>,
        cron: CronSchedule,
        source: JobSource,
    ) -> Self {
        Self {
            id: id.into(),
            photon: photon.into(),
            photon_path: None,
            method: method.into(),
            args: Value::Null,
            instance_name: None,
            cron,
            source,
            last_fired: None,
        }
    }

    /// The `command` this job issues when it fires
    pub fn to_command(&self) -> CommandRequest {
        CommandRequest {
            id: format!("job_{}_{}", self.id, uuid::Uuid::new_v4().simple()),
            photon_name: self.photon.clone(),
            photon_path: self.photon_path.clone(),
            method: self.method.clone(),
            args: self.args.clone(),
            session_id: None,
            client_type: Some("scheduler".to_string()),
            instance_name: self.instance_name.clone(),
        }
    }

    pub fn summary(&self) -> Value {
        serde_json::json!({
            "jobId": self.id,
            "photonName": self.photon,
            "method": self.method,
            "cron": self.cron.as_str(),
            "source": self.source,
        })
    }
}

/// Registry of cron jobs. The daemon's tick loop asks it which jobs are due.
#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<HashMap<String, ScheduledJob>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptor_job_id(photon: &str, method: &str) -> String {
        format!("{photon}:{method}")
    }

    /// Add or replace a job
    pub async fn register(&self, job: ScheduledJob) {
        info!("⏰ Scheduled job '{}' ({}.{} @ {})", job.id, job.photon, job.method, job.cron.as_str());
        self.jobs.lock().await.insert(job.id.clone(), job);
    }

    pub async fn unregister(&self, job_id: &str) -> bool {
        let removed = self.jobs.lock().await.remove(job_id).is_some();
        if removed {
            info!("🗑️ Unscheduled job '{}'", job_id);
        }
        removed
    }

    /// Replace every descriptor-declared job of `module`'s photon with the ones
    /// its current descriptors declare. Client jobs are left alone.
    pub async fn sync_module(&self, module: &PhotonModule) -> usize {
        let mut jobs = self.jobs.lock().await;
        jobs.retain(|_, job| !(job.source == JobSource::Descriptor && job.photon == module.name));

        let mut count = 0;
        for (descriptor, cron) in module.scheduled_methods() {
            // The manifest loader validates cron syntax; other loaders may not
            let Ok(cron) = CronSchedule::parse(cron) else {
                debug!("Skipping unparsable schedule on {}.{}", module.name, descriptor.name);
                continue;
            };
            let id = Self::descriptor_job_id(&module.name, &descriptor.name);
            let mut job = ScheduledJob::new(&id, &module.name, &descriptor.name, cron, JobSource::Descriptor);
            job.photon_path = Some(module.source_path.clone());
            jobs.insert(id, job);
            count += 1;
        }
        if count > 0 {
            debug!("⏰ {} scheduled method(s) registered for '{}'", count, module.name);
        }
        count
    }

    pub async fn list(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Jobs whose cron matches `now`, each returned at most once per minute
    pub async fn due_jobs<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Vec<ScheduledJob> {
        let minute_stamp = now.timestamp().div_euclid(60);
        let mut jobs = self.jobs.lock().await;
        let mut due = Vec::new();
        for job in jobs.values_mut() {
            if job.last_fired == Some(minute_stamp) || !job.cron.matches(now) {
                continue;
            }
            job.last_fired = Some(minute_stamp);
            due.push(job.clone());
        }
        due.sort_by(|a, b| a.id.cmp(&b.id));
        due
    }
}

/// Local wall-clock time used by the tick loop
pub fn now() -> DateTime<Local> {
    Local::now()
}
