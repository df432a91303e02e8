use gitspace_orchestrator::GitspaceService;

#[derive(Clone)]
pub struct AppState {
    pub service: GitspaceService,
}

impl AppState {
    pub fn new(service: GitspaceService) -> Self {
        Self { service }
    }
}
