use std::collections::VecDeque;

/// One pipeline's FIFO queue plus its concurrency accounting.
pub struct PipelineQueue {
    pub queue: VecDeque<String>,
    pub active: usize,
    pub max_concurrent: usize,
}

impl PipelineQueue {
    pub fn new(max_concurrent: usize) -> Self {
        PipelineQueue {
            queue: VecDeque::new(),
            active: 0,
            max_concurrent,
        }
    }
}
