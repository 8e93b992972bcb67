mod api;
mod converters;

pub use api::{
    BlockListResponse, BlockRequest, BlockTargetQuery, GateStatus, HealthResponse, QuotaQuery,
    QuotaStatusResponse, SecurityEventsQuery, SecurityEventsResponse,
};
pub use converters::{
    ColumnEnum, ConversionError, LanguageCode, QuestionTable, ReportReason, ReportStatus,
};
