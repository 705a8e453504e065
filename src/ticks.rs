/// A tick is one retired conditional branch, counted by the hardware PMU.
/// The fundamental unit of intra-task progress: per task, tick counts are
/// non-decreasing and every retired conditional branch advances them by at
/// least one.
pub type Ticks = u64;
