use uuid::Uuid;

/// Time-ordered identifier used for every row the core creates.
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_v7_uuids() {
        let a = new_uuid_v7();
        let b = new_uuid_v7();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
        assert_eq!(Uuid::parse_str(&b).unwrap().get_version_num(), 7);
    }
}
