/// Random 64-bit hex identifier for expenses, settlements, groups, and
/// events.
pub fn fresh_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_hex_and_collision_resistant_enough() {
        let a = fresh_id();
        let b = fresh_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
