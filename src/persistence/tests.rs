#[cfg(test)]
mod persistence_tests {
    use crate::persistence::{Representation, SledStore, StorageAdapter, StorageError};
    use crate::transport::ContentFormat;

    use tempfile::tempdir;

    fn text(payload: &str) -> Representation {
        Representation::new(Some(ContentFormat::TEXT_PLAIN), payload.as_bytes().to_vec())
    }

    #[test]
    fn test_put_and_get_representation() {
        let store = SledStore::temporary("unit_tests").unwrap();

        store.put("/temp", text("21.5")).unwrap();
        let stored = store.get("/temp").unwrap();

        assert_eq!(stored, text("21.5"));
    }

    #[test]
    fn test_put_replaces_previous_representation() {
        let store = SledStore::temporary("unit_tests").unwrap();

        store.put("/temp", text("21.5")).unwrap();
        store
            .put("/temp", Representation::new(None, b"22".to_vec()))
            .unwrap();

        let stored = store.get("/temp").unwrap();
        assert_eq!(stored.payload, b"22");
        assert_eq!(stored.content_format, None);
    }

    #[test]
    fn test_get_missing_path_is_not_found() {
        let store = SledStore::temporary("unit_tests").unwrap();
        assert!(matches!(store.get("/nothing"), Err(StorageError::NotFound)));
    }

    #[test]
    fn test_delete() {
        let store = SledStore::temporary("unit_tests").unwrap();
        store.put("/temp", text("1")).unwrap();

        store.delete("/temp").unwrap();

        assert!(matches!(store.get("/temp"), Err(StorageError::NotFound)));
        assert!(matches!(store.delete("/temp"), Err(StorageError::NotFound)));
    }

    #[test]
    fn test_query_by_prefix() {
        let store = SledStore::temporary("unit_tests").unwrap();
        store.put("/readings/b", text("2")).unwrap();
        store.put("/readings/a", text("1")).unwrap();
        store.put("/other", text("3")).unwrap();

        let found = store.query("/readings/").unwrap();
        let paths: Vec<_> = found.iter().map(|(p, _)| p.as_str()).collect();

        assert_eq!(paths, vec!["/readings/a", "/readings/b"]);
        assert_eq!(found[0].1, text("1"));
    }

    #[test]
    fn test_databases_are_isolated() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let first = SledStore::from_db(db.clone(), "first").unwrap();
        let second = SledStore::from_db(db, "second").unwrap();

        first.put("/temp", text("1")).unwrap();

        assert!(matches!(second.get("/temp"), Err(StorageError::NotFound)));
        assert_eq!(second.database(), "second");
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path().join("db"), "fogcoap").unwrap();

        store.put("/temp", text("21.5")).unwrap();
        store.flush().unwrap();

        assert_eq!(store.get("/temp").unwrap(), text("21.5"));
        assert!(store.updated_at("/temp").unwrap() > 0);
    }
}
