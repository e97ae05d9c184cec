//! Typed requests for the calls the client makes itself.
//!
//! Each struct names a schema function and implements [`RemoteCall`], so
//! it can be passed to [`Client::invoke`](crate::Client::invoke) like any
//! raw function object.

use tgcore_tl::{Error, RemoteCall, TlObject, TlValue};

macro_rules! request {
    ($(#[$doc:meta])* $name:ident => $ctor:literal { $($field:ident : $ty:ty => $tl:literal),* $(,)? }) => {
        $(#[$doc])*
        #[derive(Clone, Debug)]
        pub struct $name {
            $(pub $field: $ty,)*
        }

        impl RemoteCall for $name {
            #[allow(unused_mut)]
            fn to_function(&self) -> Result<TlObject, Error> {
                let mut builder = TlObject::builder($ctor)?;
                $(builder = builder.set($tl, self.$field.clone());)*
                builder.build()
            }
        }
    };
}

request!(
    /// `help.getNearestDc`
    GetNearestDc => "help.getNearestDc" {}
);

request!(
    /// `updates.getState`
    GetState => "updates.getState" {}
);

request!(
    /// `updates.getDifference`
    GetDifference => "updates.getDifference" {
        pts: i32 => "pts",
        date: i32 => "date",
        qts: i32 => "qts",
    }
);

request!(
    /// `account.getPassword`
    GetPassword => "account.getPassword" {}
);

request!(
    /// `auth.checkPassword`; `password` is an `InputCheckPasswordSRP`.
    CheckPassword => "auth.checkPassword" {
        password: TlObject => "password",
    }
);

request!(
    /// `auth.logOut`
    LogOut => "auth.logOut" {}
);

request!(
    /// `auth.signIn`
    SignIn => "auth.signIn" {
        phone_number: String => "phone_number",
        phone_code_hash: String => "phone_code_hash",
        phone_code: String => "phone_code",
    }
);

request!(
    /// `messages.sendMessage`
    SendMessage => "messages.sendMessage" {
        peer: TlObject => "peer",
        message: String => "message",
        random_id: i64 => "random_id",
    }
);

/// `auth.sendCode` with default code settings.
#[derive(Clone, Debug)]
pub struct SendCode {
    pub phone_number: String,
    pub api_id: i32,
    pub api_hash: String,
}

impl RemoteCall for SendCode {
    fn to_function(&self) -> Result<TlObject, Error> {
        TlObject::builder("auth.sendCode")?
            .set("phone_number", self.phone_number.as_str())
            .set("api_id", self.api_id)
            .set("api_hash", self.api_hash.as_str())
            .set("settings", TlObject::builder("codeSettings")?.build()?)
            .build()
    }
}

/// `users.getUsers([inputUserSelf])`
#[derive(Clone, Copy, Debug, Default)]
pub struct GetSelf;

impl RemoteCall for GetSelf {
    fn to_function(&self) -> Result<TlObject, Error> {
        let me = TlObject::builder("inputUserSelf")?.build()?;
        TlObject::builder("users.getUsers")?.set("id", vec![TlValue::Object(me)]).build()
    }
}

/// `messages.getDialogs`, first page.
#[derive(Clone, Debug)]
pub struct GetDialogs {
    pub limit: i32,
}

impl RemoteCall for GetDialogs {
    fn to_function(&self) -> Result<TlObject, Error> {
        TlObject::builder("messages.getDialogs")?
            .set("offset_date", 0i32)
            .set("offset_id", 0i32)
            .set("offset_peer", TlObject::builder("inputPeerEmpty")?.build()?)
            .set("limit", self.limit)
            .set("hash", 0i64)
            .build()
    }
}

/// `messages.getHistory`, newest first.
#[derive(Clone, Debug)]
pub struct GetHistory {
    pub peer: TlObject,
    pub limit: i32,
}

impl RemoteCall for GetHistory {
    fn to_function(&self) -> Result<TlObject, Error> {
        TlObject::builder("messages.getHistory")?
            .set("peer", self.peer.clone())
            .set("offset_id", 0i32)
            .set("offset_date", 0i32)
            .set("add_offset", 0i32)
            .set("limit", self.limit)
            .set("max_id", 0i32)
            .set("min_id", 0i32)
            .set("hash", 0i64)
            .build()
    }
}

/// MTProto `ping`; answered with a `pong`.
#[derive(Clone, Copy, Debug)]
pub struct Ping {
    pub ping_id: i64,
}

impl RemoteCall for Ping {
    fn to_function(&self) -> Result<TlObject, Error> {
        TlObject::builder("ping")?.set("ping_id", self.ping_id).build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tgcore_tl::{Registry, Serializable};

    #[test]
    fn requests_build_functions() {
        let registry = Registry::embedded();
        let calls: Vec<TlObject> = vec![
            GetState {}.to_function().unwrap(),
            GetDifference { pts: 10, date: 20, qts: 0 }.to_function().unwrap(),
            GetSelf.to_function().unwrap(),
            GetDialogs { limit: 20 }.to_function().unwrap(),
            SendCode { phone_number: "+100".into(), api_id: 1, api_hash: "h".into() }.to_function().unwrap(),
            Ping { ping_id: 7 }.to_function().unwrap(),
        ];
        for call in calls {
            assert!(call.constructor().is_function(), "{}", call.name());
            let decoded = registry.decode_object(&call.to_bytes()).unwrap();
            assert_eq!(decoded, call);
        }
    }

    #[test]
    fn return_kinds_resolve() {
        let registry = Registry::embedded();
        let state = GetState {}.to_function().unwrap();
        assert!(registry.return_kind(&state).is_some());
        let users = GetSelf.to_function().unwrap();
        assert!(registry.return_kind(&users).is_some());
    }
}
