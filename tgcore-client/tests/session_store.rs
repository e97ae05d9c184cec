use std::collections::BTreeMap;
use std::fs;
use std::io;

use tgcore_client::{FileSessionStore, SessionData, SessionStore, UpdateState};

fn sample() -> SessionData {
    let addresses = BTreeMap::from([(2, "149.154.167.51:443".to_owned()), (4, "149.154.167.91:443".to_owned())]);
    let mut data = SessionData::new(4, &addresses);
    let dc = data.dc_mut(4, || None).unwrap();
    dc.auth_key = Some([9; 256]);
    dc.salt = -77;
    dc.time_offset = 3;
    data.user_id = Some(123_456);
    data.update_state = Some(UpdateState { pts: 100, qts: 2, date: 1_700_000_000, seq: 9 });
    data
}

#[test]
fn file_store_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSessionStore::new(dir.path().join("account.session"));
    assert!(store.load().unwrap().is_none());

    let data = sample();
    store.save(&data).unwrap();
    assert_eq!(store.load().unwrap(), Some(data.clone()));

    let mut moved = data;
    moved.home_dc_id = 2;
    store.save(&moved).unwrap();
    assert_eq!(store.load().unwrap().unwrap().home_dc_id, 2);

    let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
    assert_eq!(leftovers, ["account.session"]);
}

#[test]
fn corrupt_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("account.session");
    let store = FileSessionStore::new(&path);
    store.save(&sample()).unwrap();

    let mut bytes = fs::read(&path).unwrap();
    bytes.truncate(bytes.len() / 2);
    fs::write(&path, &bytes).unwrap();
    assert_eq!(store.load().unwrap_err().kind(), io::ErrorKind::InvalidData);

    fs::write(&path, b"not a session").unwrap();
    assert_eq!(store.load().unwrap_err().kind(), io::ErrorKind::InvalidData);
}

#[test]
fn delete_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSessionStore::new(dir.path().join("account.session"));
    store.save(&sample()).unwrap();
    store.delete().unwrap();
    assert!(store.load().unwrap().is_none());
    store.delete().unwrap();
}
