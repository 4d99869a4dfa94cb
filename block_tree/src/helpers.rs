use containers::{BlockHeader, BlockNumber, U256};

/// The chain pointer a candidate is compared against.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImprovementBaseline {
    pub total_difficulty: U256,
    pub number: BlockNumber,
    pub head_is_pos: bool,
}

/// Fork choice rule shared by best-suggested and head updates.
///
/// Before the merge a strictly greater total difficulty wins. The terminal
/// block may only win while the head is still proof of work. After the merge
/// any proof of stake block at or above the current number wins.
pub fn improvement_requirements_satisfied(
    header: &BlockHeader,
    terminal_total_difficulty: Option<U256>,
    baseline: ImprovementBaseline,
) -> bool {
    let total_difficulty = header.total_difficulty.unwrap_or_default();
    let reached_ttd = header.is_post_ttd(terminal_total_difficulty);
    let td_improved = total_difficulty > baseline.total_difficulty;

    let pre_merge = td_improved && !reached_ttd;
    let terminal = td_improved
        && reached_ttd
        && header.is_terminal_block(terminal_total_difficulty)
        && !baseline.head_is_pos;
    let post_merge = reached_ttd && header.is_pos() && baseline.number <= header.number;

    pre_merge || terminal || post_merge
}

/// Highest number in `[left, right]` for which `found` holds, assuming it
/// holds on a prefix of the range.
pub fn search_highest<E>(
    left: BlockNumber,
    right: BlockNumber,
    mut found: impl FnMut(BlockNumber) -> Result<bool, E>,
) -> Result<Option<BlockNumber>, E> {
    if left > right || !found(left)? {
        return Ok(None);
    }

    let (mut low, mut high) = (left, right);
    while low < high {
        let middle = low + (high - low).div_ceil(2);
        if found(middle)? {
            low = middle;
        } else {
            high = middle - 1;
        }
    }

    Ok(Some(low))
}
