use utoipa::OpenApi;
use gitspace_orchestrator::{
    CodeRepoType, CreateConfigRequest, GitspaceConfig, GitspaceInstance, GitspaceStatus,
    HistoryKind, HistoryRecord, IdeType, InfraCallbackRequest, InstanceState, LifecycleStage,
    UpdateConfigRequest,
};

use crate::routes::gitspaces::LogEntry;
use crate::routes::infra::CallbackAccepted;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::health_check,
        crate::routes::health::readiness_check,
        crate::routes::gitspaces::list_configs,
        crate::routes::gitspaces::create_config,
        crate::routes::gitspaces::get_config,
        crate::routes::gitspaces::update_config,
        crate::routes::gitspaces::delete_gitspace,
        crate::routes::gitspaces::start_gitspace,
        crate::routes::gitspaces::stop_gitspace,
        crate::routes::gitspaces::get_status,
        crate::routes::gitspaces::list_events,
        crate::routes::gitspaces::get_logs,
        crate::routes::infra::infra_callback,
    ),
    components(
        schemas(
            GitspaceConfig,
            CreateConfigRequest,
            UpdateConfigRequest,
            GitspaceStatus,
            GitspaceInstance,
            InstanceState,
            LifecycleStage,
            HistoryRecord,
            HistoryKind,
            CodeRepoType,
            IdeType,
            InfraCallbackRequest,
            CallbackAccepted,
            LogEntry
        )
    ),
    tags(
        (name = "gitspace-api", description = "Gitspace orchestration API")
    )
)]
pub struct ApiDoc;
