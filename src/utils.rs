/// Highest index replicated on a majority of `elements`: the largest value
/// that at least `⌊n/2⌋ + 1` of the elements are greater than or equal to.
pub fn quorum_match_index<I>(elements: I) -> u64
where
    I: ExactSizeIterator<Item = u64>,
{
    let majority_threshold = elements.len() / 2 + 1;
    let mut sorted: Vec<u64> = elements.collect();
    if sorted.is_empty() {
        return 0;
    }
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    sorted[majority_threshold - 1]
}

pub fn quorum_size(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}
