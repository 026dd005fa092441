use crate::InstanceHistory;

/// Selects which instance histories `SagaLog::read_all` returns.
///
/// An instance is terminal when its most recent entry is flagged terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    /// `Some(false)` keeps only unfinished instances, `Some(true)` only
    /// finished ones, `None` keeps both.
    pub terminal: Option<bool>,

    /// Filter by saga type.
    pub saga_type: Option<String>,

    /// Maximum number of histories to return.
    pub limit: Option<usize>,
}

impl LogFilter {
    /// Matches every instance.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches instances that have not reached a terminal state.
    ///
    /// This is the recovery scan.
    pub fn non_terminal() -> Self {
        Self {
            terminal: Some(false),
            ..Default::default()
        }
    }

    /// Matches instances that have reached a terminal state.
    pub fn terminal() -> Self {
        Self {
            terminal: Some(true),
            ..Default::default()
        }
    }

    pub fn saga_type(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if the history passes the terminal and saga type filters.
    ///
    /// `limit` is applied by the caller.
    pub fn matches(&self, history: &InstanceHistory) -> bool {
        if let Some(terminal) = self.terminal
            && history.is_terminal() != terminal
        {
            return false;
        }
        if let Some(ref saga_type) = self.saga_type
            && &history.saga_type != saga_type
        {
            return false;
        }
        true
    }
}
