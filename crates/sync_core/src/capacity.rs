/// Backlog size for one job.
///
/// `max(ceil(ceil(item_count / partition_size) * max_size^-0.6), host_parallelism)`:
/// a higher concurrency ceiling drains faster and needs a shorter backlog,
/// but the backlog never drops below the host's hardware parallelism.
pub fn queue_capacity(
    item_count: u64,
    partition_size: usize,
    max_size: usize,
    host_parallelism: usize,
) -> usize {
    let partitions = item_count.div_ceil(partition_size.max(1) as u64);
    let scale = (max_size.max(1) as f64).powf(-0.6);
    let scaled = (partitions as f64 * scale).ceil() as usize;
    scaled.max(host_parallelism).max(1)
}

/// Hardware parallelism of this host, at least 1.
pub fn host_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

#[cfg(test)]
mod tests {
    use super::queue_capacity;

    #[test]
    fn larger_ceiling_shrinks_backlog() {
        // 25 partitions: 25 * 1^-0.6 = 25, 25 * 4^-0.6 = 10.88 -> 11
        assert_eq!(queue_capacity(25, 1, 1, 2), 25);
        assert_eq!(queue_capacity(25, 1, 4, 2), 11);
    }

    #[test]
    fn partitions_are_rounded_up() {
        // 25 items / 10 per partition = 3 partitions
        assert_eq!(queue_capacity(25, 10, 1, 1), 3);
    }

    #[test]
    fn never_below_host_parallelism() {
        assert_eq!(queue_capacity(3, 1, 16, 8), 8);
        assert_eq!(queue_capacity(0, 1, 4, 0), 1);
    }
}
