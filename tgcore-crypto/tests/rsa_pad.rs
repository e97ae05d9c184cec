use num_bigint::BigUint;
use tgcore_crypto::rsa::{self, Key, PrivateKey};

const N: &str = "30654442694351956368631872713681706126264010550102806812400464847547472854023496080641109821556880619102562302522840676848962704470536520351817851316402302034237651329305177886355670604046383005441678672031230815864231853909062483319842330648864856920658657626238310306952771564895678157200742238882816318648408146026741347009527888052766615171397438736363046158602190956191872739131022813898139181181281851598989613279269722701631560440234373134595102178279611490288778392550557236807740398883311849177186842871667563890175567070415187494006066942755132879440161888537880327887597625157844394621782232479228261374253";
const D: &str = "1488473690649579827487965224882335311660644331798291911115268920779223118081637401813024272237810448298505102265946102871700132235246728441789712030633401370957669193626217286858649812773343337642351373332184632555410711767430826671110491122684135540774921238858917298233066165866446004787403481845138505424688074379029132424039188441420677471367160215562798189307078546205424890941727467585022137858809492824475278849322524735018973128513453043105799568794611342491915677617827924031770877421417768271437672710539764166599962591001170868593097820410005970925710280669379216007269346642826457066470454220947025756417";

fn private_key() -> PrivateKey {
    let public = Key::new(N, "65537").unwrap();
    PrivateKey::new(public, BigUint::parse_bytes(D.as_bytes(), 10).unwrap())
}

#[test]
fn fixture_fingerprint() {
    assert_eq!(private_key().public().fingerprint(), -7001785102017565423);
}

#[test]
fn rsa_pad_roundtrip() {
    let key = private_key();
    let payload = b"p_q_inner_data goes here";
    let random: [u8; 224] = std::array::from_fn(|i| (i * 31 + 7) as u8);
    let ciphertext = rsa::encrypt_hashed(payload, key.public(), &random).unwrap();
    assert_eq!(ciphertext.len(), 256);

    let block = key.decrypt_hashed(&ciphertext).unwrap();
    assert_eq!(&block[..payload.len()], payload);
    assert_eq!(&block[payload.len()..], &random[..192 - payload.len()]);
}

#[test]
fn tampered_rsa_pad_is_rejected() {
    let key = private_key();
    let mut ciphertext = rsa::encrypt_hashed(b"abc", key.public(), &[1; 224]).unwrap();
    ciphertext[100] ^= 0x40;
    assert!(key.decrypt_hashed(&ciphertext).is_none());
}
