pub mod analyzer;
pub mod config;
pub mod context;
pub mod decoder;
pub mod error;
pub mod highlight;
pub mod history;
pub mod logging;
pub mod models;
pub mod notify;
pub mod platform;
pub mod session;
pub mod supervisor;
pub mod work_queue;

// Re-export the main error types for convenience
pub use error::{HighliveError, HighliveResult};

pub use config::{AppConfig, ChannelEntry, ConfigManager};
pub use context::ChannelContext;
pub use models::{
    AnalysisSnapshot, ChannelId, ChatEvent, Highlight, LiveStatus, MessageKind, PlatformKind,
    StreamSession, StreamSessionKey, TagKind,
};

// パイプラインの主要コンポーネント
pub use analyzer::{AnalyzerCommand, AnalyzerTask, WindowedAnalyzer};
pub use decoder::{Normalizer, TagClassifier};
pub use highlight::{HighlightLifecycleManager, HighlightStore, LifecycleJob};
pub use history::HistoryStore;
pub use notify::{Dispatcher, EndpointRegistry, Notifier};
pub use platform::ChatPlatform;
pub use session::Session;
pub use supervisor::Supervisor;
pub use work_queue::{JobHandler, WorkQueue, WorkQueueHandle};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_structure() {
        assert!(std::any::type_name::<WindowedAnalyzer>().contains("WindowedAnalyzer"));
        assert!(std::any::type_name::<HighlightStore>().contains("HighlightStore"));
        assert!(std::any::type_name::<platform::Soop>().contains("Soop"));
        assert!(std::any::type_name::<platform::Chzzk>().contains("Chzzk"));
    }

    #[test]
    fn test_error_types_re_exported() {
        let error = HighliveError::generic("test", "message");
        assert_eq!(error.to_string(), "Error in test: message");
    }
}
