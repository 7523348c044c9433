use std::fmt;

/// Lifecycle of the interactive analysis tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolState {
    /// Model load in progress; uploads disabled.
    InitialLoading,
    ReadyForUpload,
    /// A validated file is being preprocessed and analysed.
    ProcessingImage,
    ShowingResults,
    /// Absorbing until the user resets or selects another file.
    ProcessingError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    LoadSucceeded,
    LoadFailed,
    FileAccepted,
    FileRejected,
    InferenceSucceeded,
    InferenceFailed,
    RenderFailed,
    ThresholdChanged,
    /// Clears the tool. When the engine is not ready the reset becomes a reload.
    Reset { engine_ready: bool },
    RetryLoad,
}

impl ToolState {
    /// The state `event` leads to, or `None` when the event is not allowed here.
    pub fn on(self, event: Event) -> Option<ToolState> {
        use Event::*;
        use ToolState::*;

        match (self, event) {
            (InitialLoading, LoadSucceeded) => Some(ReadyForUpload),
            (InitialLoading, LoadFailed) => Some(ProcessingError),

            (ReadyForUpload | ProcessingError | ShowingResults, FileAccepted) => Some(ProcessingImage),
            (ReadyForUpload | ProcessingError | ShowingResults, FileRejected) => Some(self),

            (ProcessingImage, InferenceSucceeded) => Some(ShowingResults),
            (ProcessingImage, InferenceFailed) => Some(ProcessingError),

            (ShowingResults, ThresholdChanged) => Some(ShowingResults),
            (ShowingResults, RenderFailed) => Some(ProcessingError),

            (InitialLoading, Reset { .. }) => None,
            (_, Reset { engine_ready: true }) => Some(ReadyForUpload),
            (_, Reset { engine_ready: false }) => Some(InitialLoading),

            (ProcessingError, RetryLoad) => Some(InitialLoading),

            _ => None,
        }
    }

    pub const fn accepts_upload(self) -> bool {
        matches!(
            self,
            Self::ReadyForUpload | Self::ProcessingError | Self::ShowingResults
        )
    }

    pub const fn is_busy(self) -> bool {
        matches!(self, Self::InitialLoading | Self::ProcessingImage)
    }

    /// Headline shown for the state.
    pub const fn status_text(self) -> &'static str {
        match self {
            Self::InitialLoading => "Loading Local Analysis Model...",
            Self::ReadyForUpload => "Upload an USG Image for Analysis",
            Self::ProcessingImage => "Analyzing Image...",
            Self::ShowingResults => "Analysis Results",
            Self::ProcessingError => "Processing Failed",
        }
    }

    pub const fn detail_text(self) -> &'static str {
        match self {
            Self::InitialLoading => "Preparing analysis engine. Please wait.",
            Self::ReadyForUpload => "Drag & drop or click to select a file",
            Self::ProcessingImage => "Please wait while the local AI processes your image.",
            Self::ShowingResults => "Adjust the threshold to refine the segmentation overlay.",
            Self::ProcessingError => "An unexpected error occurred. Please try again.",
        }
    }
}

impl fmt::Display for ToolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InitialLoading => "loading the model",
            Self::ReadyForUpload => "ready for upload",
            Self::ProcessingImage => "processing an image",
            Self::ShowingResults => "showing results",
            Self::ProcessingError => "in the error state",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self {
            Self::LoadSucceeded => "finish loading the model",
            Self::LoadFailed => "fail loading the model",
            Self::FileAccepted => "accept an upload",
            Self::FileRejected => "reject an upload",
            Self::InferenceSucceeded => "show results",
            Self::InferenceFailed => "report an analysis failure",
            Self::RenderFailed => "report a rendering failure",
            Self::ThresholdChanged => "change the threshold",
            Self::Reset { .. } => "reset",
            Self::RetryLoad => "retry loading the model",
        };
        f.write_str(action)
    }
}

#[cfg(test)]
mod tests {
    use super::Event::*;
    use super::ToolState::*;
    use super::*;

    const ALL_STATES: [ToolState; 5] = [
        InitialLoading,
        ReadyForUpload,
        ProcessingImage,
        ShowingResults,
        ProcessingError,
    ];

    #[test]
    fn test_happy_path() {
        let state = InitialLoading.on(LoadSucceeded).unwrap();
        assert_eq!(state, ReadyForUpload);
        let state = state.on(FileAccepted).unwrap();
        assert_eq!(state, ProcessingImage);
        let state = state.on(InferenceSucceeded).unwrap();
        assert_eq!(state, ShowingResults);
        assert_eq!(state.on(ThresholdChanged), Some(ShowingResults));
        assert_eq!(state.on(Reset { engine_ready: true }), Some(ReadyForUpload));
    }

    #[test]
    fn test_load_failure() {
        assert_eq!(InitialLoading.on(LoadFailed), Some(ProcessingError));
        assert_eq!(ProcessingError.on(RetryLoad), Some(InitialLoading));
        assert_eq!(
            ProcessingError.on(Reset {
                engine_ready: false
            }),
            Some(InitialLoading)
        );
    }

    #[test]
    fn test_rejected_file_keeps_state() {
        for state in [ReadyForUpload, ProcessingError, ShowingResults] {
            assert_eq!(state.on(FileRejected), Some(state));
        }
    }

    #[test]
    fn test_no_upload_while_busy() {
        for state in [InitialLoading, ProcessingImage] {
            assert!(!state.accepts_upload());
            assert!(state.is_busy());
            assert_eq!(state.on(FileAccepted), None);
            assert_eq!(state.on(FileRejected), None);
        }
    }

    #[test]
    fn test_threshold_only_while_showing_results() {
        for state in ALL_STATES {
            let allowed = state.on(ThresholdChanged).is_some();
            assert_eq!(allowed, state == ShowingResults, "{:?}", state);
        }
    }

    #[test]
    fn test_reset_rules() {
        for state in ALL_STATES {
            let next = state.on(Reset { engine_ready: true });
            if state == InitialLoading {
                assert_eq!(next, None);
            } else {
                assert_eq!(next, Some(ReadyForUpload));
            }
        }
    }

    #[test]
    fn test_inference_events_need_processing() {
        for state in ALL_STATES {
            if state != ProcessingImage {
                assert_eq!(state.on(InferenceSucceeded), None);
                assert_eq!(state.on(InferenceFailed), None);
            }
        }
        assert_eq!(ProcessingImage.on(InferenceFailed), Some(ProcessingError));
        assert_eq!(ShowingResults.on(RenderFailed), Some(ProcessingError));
        assert_eq!(ReadyForUpload.on(RenderFailed), None);
    }

    #[test]
    fn test_status_text() {
        assert_eq!(InitialLoading.status_text(), "Loading Local Analysis Model...");
        assert_eq!(ProcessingError.status_text(), "Processing Failed");
        assert_eq!(
            format!("cannot {} while {}", FileAccepted, ProcessingImage),
            "cannot accept an upload while processing an image"
        );
        assert_eq!(
            ShowingResults.detail_text(),
            "Adjust the threshold to refine the segmentation overlay."
        );
        assert!(ProcessingError.detail_text().contains("try again"));
    }
}
