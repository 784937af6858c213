//! Tests against a running MySQL server.
//!
//! Connection parameters are read from `DBPOOL_TEST_*` environment variables, for example
//! `DBPOOL_TEST_CONNECTION__HOST` or `DBPOOL_TEST_CONNECTION__PASSWORD`.
//!
//! Run with `cargo test -p dbpool-mysql -- --ignored`.

use std::time::Duration;

use dbpool::{Error, Pool, PoolConfig};
use dbpool_mysql::{MysqlConnectionFactory, MysqlError};
use mysql::prelude::Queryable;

fn test_pool(min: usize, max: usize) -> Pool<MysqlConnectionFactory> {
    let mut config: PoolConfig = PoolConfig::builder()
        .with_env("DBPOOL_TEST")
        .build()
        .unwrap();
    config
        .with_bounds(min, max)
        .with_acquire_timeout(Duration::from_secs(2));
    let factory = MysqlConnectionFactory::new(&config.connection).unwrap();
    Pool::new(config, factory).unwrap()
}

#[derive(Debug)]
enum TestError {
    Pool(Error<MysqlError>),
    Query(mysql::Error),
}

impl From<Error<MysqlError>> for TestError {
    fn from(err: Error<MysqlError>) -> Self {
        Self::Pool(err)
    }
}

impl From<mysql::Error> for TestError {
    fn from(err: mysql::Error) -> Self {
        Self::Query(err)
    }
}

#[test]
#[ignore = "needs a MySQL server"]
fn select_one() {
    let pool = test_pool(1, 2);
    let one: Option<u32> = pool
        .with_connection(|conn| Ok::<_, TestError>(conn.query_first("SELECT 1")?))
        .unwrap();
    assert_eq!(one, Some(1));
    let summary = pool.shutdown();
    assert_eq!((summary.closed, summary.failed), (1, 0));
}

#[test]
#[ignore = "needs a MySQL server"]
fn killed_session_is_reconnected() {
    let pool = test_pool(1, 1);
    let first_id = pool.acquire().unwrap().connection_id();
    let mut killer = mysql::Conn::new(
        MysqlConnectionFactory::new(&pool.config().connection)
            .unwrap()
            .opts()
            .clone(),
    )
    .unwrap();
    killer.query_drop(format!("KILL {first_id}")).unwrap();
    let mut conn = pool.acquire().unwrap();
    assert_ne!(conn.connection_id(), first_id);
    let one: Option<u32> = conn.query_first("SELECT 1").unwrap();
    assert_eq!(one, Some(1));
    assert_eq!(pool.state().size, 1);
}
