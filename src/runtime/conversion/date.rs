use super::magic;
use serde::de::{self, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

/// A point in time that converts to and from a script `Date`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Date(pub SystemTime);

impl Date {
    pub fn now() -> Self {
        Date(SystemTime::now())
    }

    /// Milliseconds since the Unix epoch. Invalid values map to the epoch.
    pub fn from_millis(millis: f64) -> Self {
        if !millis.is_finite() {
            return Date::default();
        }
        let offset = Duration::try_from_secs_f64(millis.abs() / 1000.0).unwrap_or_default();
        let time = if millis >= 0.0 {
            SystemTime::UNIX_EPOCH.checked_add(offset)
        } else {
            SystemTime::UNIX_EPOCH.checked_sub(offset)
        };
        Date(time.unwrap_or(SystemTime::UNIX_EPOCH))
    }

    pub fn millis(&self) -> f64 {
        fn to_millis(d: Duration) -> f64 {
            d.as_secs() as f64 * 1000.0 + d.subsec_nanos() as f64 / 1_000_000.0
        }
        match self.0.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(after) => to_millis(after),
            Err(before) => -to_millis(before.duration()),
        }
    }
}

impl Default for Date {
    fn default() -> Self {
        Date(SystemTime::UNIX_EPOCH)
    }
}

impl From<SystemTime> for Date {
    fn from(time: SystemTime) -> Self {
        Date(time)
    }
}

impl From<Date> for SystemTime {
    fn from(date: Date) -> Self {
        date.0
    }
}

impl Serialize for Date {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_newtype_struct(magic::DATE_TOKEN, &self.millis())
    }
}

impl<'de> Deserialize<'de> for Date {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct DateVisitor;

        impl<'de> Visitor<'de> for DateVisitor {
            type Value = Date;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a date or milliseconds since the Unix epoch")
            }

            fn visit_newtype_struct<D>(self, deserializer: D) -> Result<Date, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                f64::deserialize(deserializer).map(Date::from_millis)
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<Date, E> {
                Ok(Date::from_millis(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Date, E> {
                Ok(Date::from_millis(value as f64))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Date, E> {
                Ok(Date::from_millis(value as f64))
            }
        }

        deserializer.deserialize_newtype_struct(magic::DATE_TOKEN, DateVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_round_trip() {
        for millis in [0.0, 1_500.0, -2_250.0, 1_700_000_000_123.0] {
            assert_eq!(Date::from_millis(millis).millis(), millis);
        }
    }

    #[test]
    fn test_invalid_millis_is_epoch() {
        assert_eq!(Date::from_millis(f64::NAN), Date::default());
    }

    #[test]
    fn test_json_form_is_millis() {
        let date = Date::from_millis(42.0);
        assert_eq!(serde_json::to_string(&date).unwrap(), "42.0");
        let back: Date = serde_json::from_str("42").unwrap();
        assert_eq!(back, date);
    }
}
