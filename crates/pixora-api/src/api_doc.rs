//! OpenAPI document

use utoipa::OpenApi;

use crate::error::ErrorResponse;
use crate::handlers;
use pixora_core::models::{
    ActivityRecord, AssetType, CreditBalance, GenerationRequest, GenerationResponse, TierInfo,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::generate::generate_image,
        handlers::generate::generate_video,
        handlers::generate::generation_callback,
        handlers::credits::get_credits,
        handlers::credits::get_credit_row,
        handlers::credits::get_subscription_tier,
        handlers::credits::grant_credits,
        handlers::users::provision_user,
        handlers::activity::list_activity,
        handlers::activity::latest_activity,
        handlers::activity::record_upload,
        handlers::health::health,
    ),
    components(schemas(
        GenerationRequest,
        GenerationResponse,
        AssetType,
        ActivityRecord,
        CreditBalance,
        TierInfo,
        ErrorResponse,
        handlers::generate::GenerationCallback,
        handlers::credits::CreditBalanceResponse,
        handlers::credits::CreditGrantRequest,
        handlers::credits::CreditGrantResponse,
        handlers::users::ProvisionUserRequest,
        handlers::activity::RecordUploadRequest,
    )),
    tags(
        (name = "generations", description = "AI image/video generation"),
        (name = "credits", description = "Credit balances and grants"),
        (name = "activity", description = "Activity ledger"),
        (name = "users", description = "User provisioning"),
        (name = "health", description = "Service health")
    ),
    info(
        title = "Pixora API",
        description = "Credit metering and admission control for AI image/video generation"
    )
)]
pub struct ApiDoc;
