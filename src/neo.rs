use chrono::NaiveDate;
use serde_json::Value;

use crate::error::MalformedRecord;

/// One near-Earth object together with a single close-approach snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct NeoObject {
    pub id: i64,
    pub reference_id: i64,
    pub name: String,
    pub absolute_magnitude: f64,
    /// Not guaranteed to be `<= diameter_max_km`; the feed does not enforce it.
    pub diameter_min_km: f64,
    pub diameter_max_km: f64,
    pub is_potentially_hazardous: bool,
    pub approach: CloseApproach,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseApproach {
    pub date: NaiveDate,
    pub relative_velocity_kmph: f64,
    pub miss_distance_au: f64,
    pub miss_distance_lunar: f64,
    pub miss_distance_km: f64,
    pub orbiting_body: String,
}

impl CloseApproach {
    pub fn is_earth(&self) -> bool {
        self.orbiting_body == "Earth"
    }
}

/// Convert one raw feed entry into a [`NeoObject`].
///
/// Only the first entry of `close_approach_data` is used. Numeric fields may arrive
/// as JSON numbers or as numeric strings (the feed sends most of them as strings).
pub fn normalize(raw: &Value) -> Result<NeoObject, MalformedRecord> {
    let fail = |reason: String| MalformedRecord {
        reference: reference_of(raw),
        reason,
    };

    let approach = raw
        .get("close_approach_data")
        .ok_or_else(|| fail("missing field `close_approach_data`".into()))?
        .as_array()
        .ok_or_else(|| fail("`close_approach_data` is not a list".into()))?
        .first()
        .ok_or_else(|| fail("no close approach events".into()))?;

    build(&Fields(raw), &Fields(approach)).map_err(fail)
}

fn build(record: &Fields<'_>, event: &Fields<'_>) -> Result<NeoObject, String> {
    Ok(NeoObject {
        id: record.int(&["id"])?,
        reference_id: record.int(&["neo_reference_id"])?,
        name: record.string(&["name"])?,
        absolute_magnitude: record.float(&["absolute_magnitude_h"])?,
        diameter_min_km: record.float(&[
            "estimated_diameter",
            "kilometers",
            "estimated_diameter_min",
        ])?,
        diameter_max_km: record.float(&[
            "estimated_diameter",
            "kilometers",
            "estimated_diameter_max",
        ])?,
        is_potentially_hazardous: record.boolean(&["is_potentially_hazardous_asteroid"])?,
        approach: CloseApproach {
            date: event.date(&["close_approach_date"]).map_err(in_event)?,
            relative_velocity_kmph: event
                .float(&["relative_velocity", "kilometers_per_hour"])
                .map_err(in_event)?,
            miss_distance_au: event
                .float(&["miss_distance", "astronomical"])
                .map_err(in_event)?,
            miss_distance_lunar: event
                .float(&["miss_distance", "lunar"])
                .map_err(in_event)?,
            miss_distance_km: event
                .float(&["miss_distance", "kilometers"])
                .map_err(in_event)?,
            orbiting_body: event.string(&["orbiting_body"]).map_err(in_event)?,
        },
    })
}

fn in_event(reason: String) -> String {
    format!("close_approach_data[0].{}", reason)
}

fn reference_of(raw: &Value) -> String {
    ["neo_reference_id", "id"]
        .iter()
        .find_map(|key| match raw.get(*key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Typed access to nested members of a raw JSON object. Errors are the dotted path
/// of the offending member plus what was wrong with it.
struct Fields<'a>(&'a Value);

impl<'a> Fields<'a> {
    fn get(&self, path: &[&str]) -> Result<&'a Value, String> {
        let mut current = self.0;
        for key in path {
            current = current
                .get(*key)
                .ok_or_else(|| format!("missing field `{}`", path.join(".")))?;
        }
        if current.is_null() {
            return Err(format!("field `{}` is null", path.join(".")));
        }
        Ok(current)
    }

    fn int(&self, path: &[&str]) -> Result<i64, String> {
        let value = self.get(path)?;
        let parsed = match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| format!("field `{}` is not an integer: {}", path.join("."), value))
    }

    fn float(&self, path: &[&str]) -> Result<f64, String> {
        let value = self.get(path)?;
        let parsed = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        parsed
            .filter(|f| f.is_finite())
            .ok_or_else(|| format!("field `{}` is not a number: {}", path.join("."), value))
    }

    fn string(&self, path: &[&str]) -> Result<String, String> {
        let value = self.get(path)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| format!("field `{}` is not a string: {}", path.join("."), value))
    }

    fn boolean(&self, path: &[&str]) -> Result<bool, String> {
        let value = self.get(path)?;
        value
            .as_bool()
            .ok_or_else(|| format!("field `{}` is not a boolean: {}", path.join("."), value))
    }

    fn date(&self, path: &[&str]) -> Result<NaiveDate, String> {
        let raw = self.string(path)?;
        NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map_err(|e| format!("field `{}` is not a YYYY-MM-DD date ({}): {}", path.join("."), e, raw))
    }
}
