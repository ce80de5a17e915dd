use crate::{
    BlockType, Id, SubscriberType,
    storage::{DbConnectionError, DbError, SpecificError},
};
use rusqlite::{
    ErrorCode, ToSql,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
};
use std::str::FromStr;
use tracing::error;

impl<T> ToSql for Id<T> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(&**self))
    }
}

impl<T> FromSql for Id<T> {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(Id::new(value.as_str()?))
    }
}

fn enum_column_result<E: FromStr>(value: ValueRef<'_>) -> FromSqlResult<E>
where
    E::Err: std::fmt::Debug,
{
    let str = value.as_str()?;
    str.parse::<E>().map_err(|err| {
        error!(
            "Cannot convert to {} value:`{str}` - {err:?}",
            std::any::type_name::<E>()
        );
        FromSqlError::InvalidType
    })
}

impl ToSql for BlockType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let str: &'static str = self.into();
        Ok(ToSqlOutput::from(str))
    }
}

impl FromSql for BlockType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        enum_column_result(value)
    }
}

impl ToSql for SubscriberType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let str: &'static str = self.into();
        Ok(ToSqlOutput::from(str))
    }
}

impl FromSql for SubscriberType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        enum_column_result(value)
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::QueryReturnedNoRows => DbError::Specific(SpecificError::NotFound),
            rusqlite::Error::SqliteFailure(ffi, _)
                if matches!(ffi.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                DbError::Connection(DbConnectionError::Busy)
            }
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => {
                error!("Cannot convert row - {err:?}");
                DbError::Specific(SpecificError::ConsistencyError(err.to_string()))
            }
            _ => {
                error!("Sqlite error - {err:?}");
                DbError::Connection(DbConnectionError::Other(err.to_string()))
            }
        }
    }
}
