/// Compares 8 bit flow versions with a 128 wide wrap window, so that a
/// version that recently wrapped past zero still compares greater than a
/// version just below the wrap point.
#[inline]
pub fn sequence_greater_than(s1: u8, s2: u8) -> bool {
    ((s1 > s2) && (s1 - s2 <= 128)) || ((s1 < s2) && (s2 - s1 > 128))
}

#[inline]
pub fn sequence_less_than(s1: u8, s2: u8) -> bool {
    sequence_greater_than(s2, s1)
}
