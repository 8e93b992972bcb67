//! Conversions between platform enums and their stored column values.
//!
//! Columns hold the lower-case variant name (`"false_info"`, `"phq9"`). Each
//! enum lists its `(variant, column)` pairs once in [`ColumnEnum::TABLE`];
//! both directions are driven by that table so they cannot drift apart.
//!
//! | Enum            | Absent column maps to |
//! |-----------------|-----------------------|
//! | `LanguageCode`  | `VI`                  |
//! | `QuestionTable` | `PHQ9`                |
//! | `ReportReason`  | `OTHER`               |
//! | `ReportStatus`  | `PENDING`             |
//!
//! An unknown column value is a hard error, never silently mapped.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A stored column value could not be mapped back to an enum.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("Unrecognized {type_name} value: '{value}'")]
    Unrecognized {
        type_name: &'static str,
        value: String,
    },
}

/// Enum persisted as a lower-case string column.
pub trait ColumnEnum: Copy + Sized + 'static {
    /// Name used in error messages.
    const TYPE_NAME: &'static str;

    /// Every variant with its column value.
    const TABLE: &'static [(Self, &'static str)];

    /// Value used when the column is absent.
    const DEFAULT: Self;

    /// Column value for a variant.
    fn to_column(self) -> &'static str;

    /// Variant for a column value; absent maps to [`ColumnEnum::DEFAULT`].
    ///
    /// Matching ignores ASCII case.
    fn from_column(column: Option<&str>) -> Result<Self, ConversionError> {
        let Some(value) = column else {
            return Ok(Self::DEFAULT);
        };

        Self::TABLE
            .iter()
            .find(|(_, col)| col.eq_ignore_ascii_case(value))
            .map(|(variant, _)| *variant)
            .ok_or_else(|| ConversionError::Unrecognized {
                type_name: Self::TYPE_NAME,
                value: value.to_string(),
            })
    }
}

/// Implements the table, `to_column`, `Display` and `FromStr` for a column enum.
macro_rules! column_enum {
    ($ty:ident, $name:literal, default = $default:ident, { $($variant:ident => $column:literal),+ $(,)? }) => {
        impl ColumnEnum for $ty {
            const TYPE_NAME: &'static str = $name;
            const TABLE: &'static [(Self, &'static str)] = &[$(($ty::$variant, $column)),+];
            const DEFAULT: Self = $ty::$default;

            fn to_column(self) -> &'static str {
                match self {
                    $($ty::$variant => $column),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.to_column())
            }
        }

        impl FromStr for $ty {
            type Err = ConversionError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_column(Some(s))
            }
        }
    };
}

/// Content language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LanguageCode {
    Vi,
    En,
}

column_enum!(LanguageCode, "LanguageCode", default = Vi, {
    Vi => "vi",
    En => "en",
});

/// Screening questionnaire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuestionTable {
    #[serde(rename = "PHQ9")]
    Phq9,
    #[serde(rename = "GAD7")]
    Gad7,
    #[serde(rename = "DASS21")]
    Dass21,
    #[serde(rename = "EPDS")]
    Epds,
}

column_enum!(QuestionTable, "QuestionTable", default = Phq9, {
    Phq9 => "phq9",
    Gad7 => "gad7",
    Dass21 => "dass21",
    Epds => "epds",
});

/// Why content was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportReason {
    Spam,
    Harassment,
    FalseInfo,
    HateSpeech,
    SelfHarm,
    InappropriateContent,
    Other,
}

column_enum!(ReportReason, "ReportReason", default = Other, {
    Spam => "spam",
    Harassment => "harassment",
    FalseInfo => "false_info",
    HateSpeech => "hate_speech",
    SelfHarm => "self_harm",
    InappropriateContent => "inappropriate_content",
    Other => "other",
});

/// Moderation state of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Pending,
    Reviewing,
    Resolved,
    Rejected,
}

column_enum!(ReportStatus, "ReportStatus", default = Pending, {
    Pending => "pending",
    Reviewing => "reviewing",
    Resolved => "resolved",
    Rejected => "rejected",
});

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_to_column_is_lower_case() {
        assert_eq!(LanguageCode::En.to_column(), "en");
        assert_eq!(QuestionTable::Dass21.to_column(), "dass21");
        assert_eq!(ReportReason::FalseInfo.to_column(), "false_info");
        assert_eq!(ReportStatus::Reviewing.to_column(), "reviewing");
    }

    #[test]
    fn test_absent_column_maps_to_default() {
        assert_eq!(LanguageCode::from_column(None).unwrap(), LanguageCode::Vi);
        assert_eq!(QuestionTable::from_column(None).unwrap(), QuestionTable::Phq9);
        assert_eq!(ReportReason::from_column(None).unwrap(), ReportReason::Other);
        assert_eq!(ReportStatus::from_column(None).unwrap(), ReportStatus::Pending);
    }

    #[test]
    fn test_from_column_ignores_case() {
        assert_eq!(
            ReportReason::from_column(Some("HATE_SPEECH")).unwrap(),
            ReportReason::HateSpeech
        );
        assert_eq!(
            QuestionTable::from_column(Some("Gad7")).unwrap(),
            QuestionTable::Gad7
        );
        assert_eq!(LanguageCode::from_column(Some("EN")).unwrap(), LanguageCode::En);
    }

    #[test]
    fn test_unknown_value_is_an_error() {
        let err = ReportStatus::from_column(Some("archived")).unwrap_err();
        assert_eq!(
            err,
            ConversionError::Unrecognized {
                type_name: "ReportStatus",
                value: "archived".to_string(),
            }
        );
        assert_eq!(err.to_string(), "Unrecognized ReportStatus value: 'archived'");
    }

    #[test]
    fn test_empty_string_is_not_absent() {
        assert!(LanguageCode::from_column(Some("")).is_err());
    }

    #[test]
    fn test_every_variant_survives_the_column() {
        fn check<E: ColumnEnum + PartialEq + fmt::Debug>() {
            for (variant, column) in E::TABLE {
                assert_eq!(variant.to_column(), *column);
                assert_eq!(E::from_column(Some(*column)).unwrap(), *variant);
            }
        }
        check::<LanguageCode>();
        check::<QuestionTable>();
        check::<ReportReason>();
        check::<ReportStatus>();
    }

    #[test]
    fn test_from_str_and_display() {
        let reason: ReportReason = "self_harm".parse().unwrap();
        assert_eq!(reason, ReportReason::SelfHarm);
        assert_eq!(reason.to_string(), "self_harm");
        assert!("nope".parse::<ReportReason>().is_err());
    }

    #[test]
    fn test_serde_uses_upper_case_names() {
        assert_eq!(
            serde_json::to_string(&ReportReason::InappropriateContent).unwrap(),
            r#""INAPPROPRIATE_CONTENT""#
        );
        assert_eq!(
            serde_json::to_string(&QuestionTable::Dass21).unwrap(),
            r#""DASS21""#
        );
        let lang: LanguageCode = serde_json::from_str(r#""VI""#).unwrap();
        assert_eq!(lang, LanguageCode::Vi);
    }
}
