use crate::core::ids::DeviceId;

#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    BatchStart { total_jobs: u64 },
    BatchFinish,

    JobStart { job: usize, device: DeviceId },
    GenerationFinish { job: usize, generation: u64, best_energy: f32 },
    JobFinish { job: usize },

    Message(String),
}

pub type ProgressCallback<'a> = Box<dyn Fn(Progress) + Send + Sync + 'a>;

#[derive(Default)]
pub struct ProgressReporter<'a> {
    callback: Option<ProgressCallback<'a>>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: ProgressCallback<'a>) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    #[inline]
    pub fn report(&self, event: Progress) {
        if let Some(cb) = &self.callback {
            cb(event);
        }
    }
}
