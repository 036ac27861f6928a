//! Mapping between [`UserDocument`] and its stored BSON shape.
//!
//! Both in-document maps are sub-documents keyed by id (`userUsage` by the
//! decimal session id) and are written in ascending key order.

use common::{SessionId, UserId};
use std::collections::BTreeMap;
use store::bson::{doc, Bson, DateTime, Document};
use thiserror::Error;

use crate::document::{RecentTransaction, UsageReservation, UserDocument};

pub mod field {
    pub const ID: &str = "_id";
    pub const USER_ID: &str = "userId";
    pub const JSON_OBJECT: &str = "userJsonObject";
    pub const LAST_SEEN: &str = "userLastSeen";
    pub const SOFT_LOCK_SESSION_ID: &str = "userSoftLockSessionId";
    pub const SOFT_LOCK_EXPIRY: &str = "userSoftlockExpiry";
    pub const BALANCE: &str = "balance";
    pub const RECENT_TRANSACTIONS: &str = "userRecentTransactions";
    pub const USAGE: &str = "userUsage";

    pub const USER_TXN_ID: &str = "userTxnId";
    pub const TXN_TIME: &str = "txnTime";
    pub const SESSION_ID: &str = "sessionId";
    pub const APPROVED_AMOUNT: &str = "approvedAmount";
    pub const SPENT_AMOUNT: &str = "spentAmount";
    pub const PURPOSE: &str = "purpose";
    pub const ALLOCATED_AMOUNT: &str = "allocatedAmount";
    pub const LAST_DATE: &str = "lastDate";
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("missing field `{0}`")]
    Missing(String),

    #[error("field `{field}` should be {expected}, found {found}")]
    WrongType {
        field: String,
        expected: &'static str,
        found: String,
    },
}

impl DecodeError {
    /// Qualify the offending field with the path of its parent
    fn within(self, parent: &str) -> Self {
        match self {
            DecodeError::Missing(field) => DecodeError::Missing(format!("{}.{}", parent, field)),
            DecodeError::WrongType {
                field,
                expected,
                found,
            } => DecodeError::WrongType {
                field: format!("{}.{}", parent, field),
                expected,
                found,
            },
        }
    }
}

/// Typed getters over a stored document
mod get {
    use super::DecodeError;
    use common::SessionId;
    use store::bson::{Bson, Document};

    fn wrong_type(field: &str, expected: &'static str, found: &Bson) -> DecodeError {
        DecodeError::WrongType {
            field: field.to_string(),
            expected,
            found: format!("{:?}", found.element_type()),
        }
    }

    fn required<'a>(doc: &'a Document, field: &str) -> Result<&'a Bson, DecodeError> {
        doc.get(field)
            .ok_or_else(|| DecodeError::Missing(field.to_string()))
    }

    pub fn int(doc: &Document, field: &str) -> Result<i64, DecodeError> {
        match required(doc, field)? {
            Bson::Int64(v) => Ok(*v),
            Bson::Int32(v) => Ok(i64::from(*v)),
            other => Err(wrong_type(field, "an integer", other)),
        }
    }

    pub fn string<'a>(doc: &'a Document, field: &str) -> Result<&'a str, DecodeError> {
        match required(doc, field)? {
            Bson::String(v) => Ok(v),
            other => Err(wrong_type(field, "a string", other)),
        }
    }

    pub fn datetime(doc: &Document, field: &str) -> Result<i64, DecodeError> {
        match required(doc, field)? {
            Bson::DateTime(v) => Ok(v.timestamp_millis()),
            Bson::Int64(v) => Ok(*v),
            other => Err(wrong_type(field, "a datetime", other)),
        }
    }

    /// Absent, null and the integer `NO_SESSION` all read as unset
    pub fn opt_datetime(doc: &Document, field: &str) -> Result<Option<i64>, DecodeError> {
        match doc.get(field) {
            None | Some(Bson::Null) => Ok(None),
            Some(Bson::DateTime(v)) => Ok(Some(v.timestamp_millis())),
            Some(Bson::Int64(v)) if *v == SessionId::NO_SESSION.0 => Ok(None),
            Some(Bson::Int64(v)) => Ok(Some(*v)),
            Some(Bson::Int32(v)) => Ok(Some(i64::from(*v))),
            Some(other) => Err(wrong_type(field, "a datetime", other)),
        }
    }

    /// An absent map reads as empty
    pub fn opt_sub_document<'a>(
        doc: &'a Document,
        field: &str,
    ) -> Result<Option<&'a Document>, DecodeError> {
        match doc.get(field) {
            None | Some(Bson::Null) => Ok(None),
            Some(Bson::Document(v)) => Ok(Some(v)),
            Some(other) => Err(wrong_type(field, "a sub-document", other)),
        }
    }

    pub fn sub_document<'a>(doc: &'a Document, field: &str) -> Result<&'a Document, DecodeError> {
        match required(doc, field)? {
            Bson::Document(v) => Ok(v),
            other => Err(wrong_type(field, "a sub-document", other)),
        }
    }
}

fn datetime(ms: i64) -> Bson {
    Bson::DateTime(DateTime::from_millis(ms))
}

/// Stored form of an optional instant: a datetime or null
pub fn opt_datetime(ms: Option<i64>) -> Bson {
    ms.map(datetime).unwrap_or(Bson::Null)
}

fn encode_recent_transaction(txn: &RecentTransaction) -> Document {
    doc! {
        field::USER_ID: txn.user_id.0,
        field::USER_TXN_ID: txn.user_txn_id.as_str(),
        field::TXN_TIME: datetime(txn.txn_time_ms),
        field::SESSION_ID: txn.session_id.0,
        field::APPROVED_AMOUNT: txn.approved_amount,
        field::SPENT_AMOUNT: txn.spent_amount,
        field::PURPOSE: txn.purpose.as_str(),
    }
}

fn encode_usage(usage: &UsageReservation) -> Document {
    doc! {
        field::USER_ID: usage.user_id.0,
        field::ALLOCATED_AMOUNT: usage.allocated_amount,
        field::SESSION_ID: usage.session_id.0,
        field::LAST_DATE: datetime(usage.last_date_ms),
    }
}

pub fn encode_user(user: &UserDocument) -> Document {
    let mut recent_transactions = Document::new();
    for (txn_id, txn) in &user.recent_transactions {
        recent_transactions.insert(txn_id.clone(), encode_recent_transaction(txn));
    }

    let mut usage = Document::new();
    for (session_id, reservation) in &user.usage {
        usage.insert(session_id.to_string(), encode_usage(reservation));
    }

    doc! {
        field::ID: user.user_id.0,
        field::USER_ID: user.user_id.0,
        field::JSON_OBJECT: user.json_object.as_str(),
        field::LAST_SEEN: opt_datetime(user.last_seen_ms),
        field::SOFT_LOCK_SESSION_ID: user.soft_lock_session_id.0,
        field::SOFT_LOCK_EXPIRY: opt_datetime(user.soft_lock_expiry_ms),
        field::BALANCE: user.balance,
        field::RECENT_TRANSACTIONS: recent_transactions,
        field::USAGE: usage,
    }
}

fn decode_recent_transaction(doc: &Document) -> Result<RecentTransaction, DecodeError> {
    Ok(RecentTransaction {
        user_id: UserId(get::int(doc, field::USER_ID)?),
        user_txn_id: get::string(doc, field::USER_TXN_ID)?.to_string(),
        txn_time_ms: get::datetime(doc, field::TXN_TIME)?,
        session_id: SessionId(get::int(doc, field::SESSION_ID)?),
        approved_amount: get::int(doc, field::APPROVED_AMOUNT)?,
        spent_amount: get::int(doc, field::SPENT_AMOUNT)?,
        purpose: get::string(doc, field::PURPOSE)?.to_string(),
    })
}

fn decode_usage(doc: &Document) -> Result<UsageReservation, DecodeError> {
    Ok(UsageReservation {
        user_id: UserId(get::int(doc, field::USER_ID)?),
        allocated_amount: get::int(doc, field::ALLOCATED_AMOUNT)?,
        session_id: SessionId(get::int(doc, field::SESSION_ID)?),
        last_date_ms: get::datetime(doc, field::LAST_DATE)?,
    })
}

pub fn decode_user(doc: &Document) -> Result<UserDocument, DecodeError> {
    let mut recent_transactions = BTreeMap::new();
    if let Some(entries) = get::opt_sub_document(doc, field::RECENT_TRANSACTIONS)? {
        for (key, _) in entries {
            let entry = get::sub_document(entries, key)
                .map_err(|e| e.within(field::RECENT_TRANSACTIONS))?;
            let txn = decode_recent_transaction(entry)
                .map_err(|e| e.within(&format!("{}.{}", field::RECENT_TRANSACTIONS, key)))?;
            recent_transactions.insert(txn.user_txn_id.clone(), txn);
        }
    }

    let mut usage = BTreeMap::new();
    if let Some(entries) = get::opt_sub_document(doc, field::USAGE)? {
        for (key, _) in entries {
            let entry = get::sub_document(entries, key).map_err(|e| e.within(field::USAGE))?;
            let reservation = decode_usage(entry)
                .map_err(|e| e.within(&format!("{}.{}", field::USAGE, key)))?;
            usage.insert(reservation.session_id, reservation);
        }
    }

    Ok(UserDocument {
        user_id: UserId(get::int(doc, field::USER_ID)?),
        json_object: get::string(doc, field::JSON_OBJECT)?.to_string(),
        last_seen_ms: get::opt_datetime(doc, field::LAST_SEEN)?,
        soft_lock_session_id: SessionId(get::int(doc, field::SOFT_LOCK_SESSION_ID)?),
        soft_lock_expiry_ms: get::opt_datetime(doc, field::SOFT_LOCK_EXPIRY)?,
        balance: get::int(doc, field::BALANCE)?,
        recent_transactions,
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const NOW: i64 = 1_700_000_000_000;

    fn sample_user() -> UserDocument {
        let mut user = UserDocument::new_user(UserId(12), "{\"a\":1}".to_string(), 300, NOW);
        user.add_credit(100, "Txn1", NOW);
        user.report_quota_usage(100, 10, SessionId(100), "TX2", NOW);
        user.soft_lock_session_id = SessionId(77);
        user.soft_lock_expiry_ms = Some(NOW + 50);
        user
    }

    #[test]
    fn test_encode_shape() {
        let encoded = encode_user(&sample_user());

        assert_eq!(encoded.get_i64(field::ID).unwrap(), 12);
        assert_eq!(encoded.get_i64(field::USER_ID).unwrap(), 12);
        assert_eq!(encoded.get_i64(field::BALANCE).unwrap(), 300);
        assert_eq!(encoded.get_i64(field::SOFT_LOCK_SESSION_ID).unwrap(), 77);
        assert_eq!(
            encoded.get_datetime(field::SOFT_LOCK_EXPIRY).unwrap().timestamp_millis(),
            NOW + 50
        );

        let usage = encoded.get_document(field::USAGE).unwrap();
        let reservation = usage.get_document("100").unwrap();
        assert_eq!(reservation.get_i64(field::ALLOCATED_AMOUNT).unwrap(), 10);

        let keys: Vec<&String> = encoded
            .get_document(field::RECENT_TRANSACTIONS)
            .unwrap()
            .keys()
            .collect();
        assert_eq!(keys, ["Create_12", "TX2", "Txn1"]);
    }

    #[test]
    fn test_round_trip() {
        let user = sample_user();
        assert_eq!(decode_user(&encode_user(&user)).unwrap(), user);

        let unlocked = UserDocument::new_user(UserId(1), String::new(), 0, NOW);
        assert_eq!(decode_user(&encode_user(&unlocked)).unwrap(), unlocked);
    }

    #[test]
    fn test_lenient_reads() {
        let doc = doc! {
            "_id": 5_i32,
            "userId": 5_i32,
            "userJsonObject": "{}",
            "userSoftLockSessionId": i64::MIN,
            "userSoftlockExpiry": i64::MIN,
            "balance": 10_i32,
        };

        let user = decode_user(&doc).unwrap();
        assert_eq!(user.user_id, UserId(5));
        assert_eq!(user.balance, 10);
        assert!(user.soft_lock_session_id.is_none());
        assert_eq!(user.soft_lock_expiry_ms, None);
        assert_eq!(user.last_seen_ms, None);
        assert!(user.recent_transactions.is_empty());
        assert!(user.usage.is_empty());
    }

    #[test]
    fn test_named_errors() {
        let mut doc = encode_user(&sample_user());
        doc.remove(field::BALANCE);
        assert_eq!(
            decode_user(&doc).unwrap_err(),
            DecodeError::Missing("balance".to_string())
        );

        let mut doc = encode_user(&sample_user());
        doc.insert(field::JSON_OBJECT, 3_i64);
        assert!(matches!(
            decode_user(&doc).unwrap_err(),
            DecodeError::WrongType { field: name, expected: "a string", .. } if name == "userJsonObject"
        ));

        let mut doc = encode_user(&sample_user());
        doc.insert(field::USAGE, doc! { "100": { "sessionId": 100_i64 } });
        assert_eq!(
            decode_user(&doc).unwrap_err(),
            DecodeError::Missing("userUsage.100.userId".to_string())
        );

        let mut doc = encode_user(&sample_user());
        doc.insert(field::RECENT_TRANSACTIONS, doc! { "T": "broken" });
        assert!(matches!(
            decode_user(&doc).unwrap_err(),
            DecodeError::WrongType { field: name, .. } if name == "userRecentTransactions.T"
        ));
    }

    fn recent_transaction() -> impl Strategy<Value = RecentTransaction> {
        (
            "[A-Za-z0-9_]{1,12}",
            any::<i64>(),
            any::<i64>(),
            any::<i64>(),
            any::<i64>(),
            ".{0,20}",
        )
            .prop_map(|(txn_id, time, session, approved, spent, purpose)| RecentTransaction {
                user_id: UserId(9),
                user_txn_id: txn_id,
                txn_time_ms: time,
                session_id: SessionId(session),
                approved_amount: approved,
                spent_amount: spent,
                purpose,
            })
    }

    fn usage_reservation() -> impl Strategy<Value = UsageReservation> {
        (any::<i64>(), any::<i64>(), any::<i64>()).prop_map(|(allocated, session, date)| {
            UsageReservation {
                user_id: UserId(9),
                allocated_amount: allocated,
                session_id: SessionId(session),
                last_date_ms: date,
            }
        })
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            json in ".{0,40}",
            last_seen in proptest::option::of(any::<i64>()),
            lock in any::<i64>(),
            expiry in proptest::option::of(any::<i64>()),
            balance in any::<i64>(),
            txns in prop::collection::vec(recent_transaction(), 0..6),
            usages in prop::collection::vec(usage_reservation(), 0..6),
        ) {
            let user = UserDocument {
                user_id: UserId(9),
                json_object: json,
                last_seen_ms: last_seen,
                soft_lock_session_id: SessionId(lock),
                soft_lock_expiry_ms: expiry,
                balance,
                recent_transactions: txns.into_iter().map(|t| (t.user_txn_id.clone(), t)).collect(),
                usage: usages.into_iter().map(|u| (u.session_id, u)).collect(),
            };

            prop_assert_eq!(decode_user(&encode_user(&user)).unwrap(), user);
        }
    }
}
