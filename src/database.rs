//! Module for connecting to a postgres database and storing the readings received from the
//! pipeline in the `temperature_readings` table.
use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslVerifyMode};
use postgres::types::Json;
use postgres::{Client, NoTls};
use postgres_openssl::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::SensorReading;

static SQL_INSERT_READING: &str = include_str!("sql/insert_reading.sql");

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
/// Struct modeling the parameters required for a database connection.
///
/// This includes SSL/TLS encryption.
pub struct DatabaseParameters
{
    /// The hostname of the database server.
    pub hostname: String,
    /// The port for the database server.
    pub port: u16,
    /// The username to connect as.
    pub username: String,
    /// The password to connect with.
    pub password: String,
    /// The database to open on the server.
    pub database: String,
    /// Flag to enable tls for the database server connection.
    pub tls_enable: bool,
    /// Parameters for the tls connection to the database server.
    pub tls_params: Option<DatabaseTlsParameters>,
}

impl Default for DatabaseParameters {
    fn default() -> Self {
        DatabaseParameters {
            hostname: String::from("postgres"),
            port: 5432,
            username: String::from("sensor_user"),
            password: String::from("sensor123"),
            database: String::from("sensors"),
            tls_enable: false,
            tls_params: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Struct for the parameters required for a tls connection to the database.
pub struct DatabaseTlsParameters {
    /// The path to the server certificate for TLS encryption.
    pub server_ca_path: String,
    /// The path to the client certificate for TLS encryption.
    pub client_cert_path: String,
    /// The path to the client key for TLS encryption.
    pub client_key_path: String,
}

#[derive(Error, Debug)]
/// Errors that prevent the database connection from being established.
pub enum ConnectError {
    #[error("TLS enabled but no TLS parameters specified")]
    MissingTlsParameters,
    #[error("could not set up the TLS connector: {0}")]
    Tls(#[from] openssl::error::ErrorStack),
    #[error("could not establish database connection: {0}")]
    Postgres(#[from] postgres::Error),
}

#[derive(Error, Debug)]
#[error("could not store reading of '{location}': {cause}")]
/// A failed insert. The transaction of the insert has been rolled back.
pub struct WriteError {
    /// Location of the reading that was not stored.
    pub location: String,
    /// The underlying database or serialization error.
    #[source]
    pub cause: Box<dyn std::error::Error + Send + Sync>,
}

impl WriteError {
    pub fn new<E>(reading: &SensorReading, cause: E) -> WriteError
        where E: Into<Box<dyn std::error::Error + Send + Sync>>
    {
        WriteError {
            location: reading.location.clone(),
            cause: cause.into(),
        }
    }
}

/// A sink for readings. Every call writes exactly one reading or nothing at all.
pub trait ReadingStore {
    /// Stores a single reading in its own transaction.
    fn write(&mut self, reading: &SensorReading) -> Result<(), WriteError>;
}

/// Reading store backed by a single postgres connection.
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    /// Establishes the database connection.
    ///
    /// # Arguments
    ///
    /// * `params` - Parameters for the database connection.
    ///
    /// # Errors
    ///
    /// Errors occur when one of the following conditions is met:
    ///
    /// * TLS is enabled but no TLS parameters are given.
    ///
    /// * The files for the TLS connection cannot be found.
    ///
    /// * The connection cannot be established.
    ///
    /// * The the user is not authorized for the database.
    ///
    pub fn connect(params: &DatabaseParameters) -> Result<PostgresStore, ConnectError> {
        let mut config = postgres::Config::new();
        config
            .host(&params.hostname)
            .port(params.port)
            .user(&params.username)
            .password(&params.password)
            .dbname(&params.database)
            .application_name("heatlogd");

        let client = if params.tls_enable {
            let tls_params = params.tls_params.as_ref().ok_or(ConnectError::MissingTlsParameters)?;
            config.connect(tls_connector(tls_params)?)?
        } else {
            config.connect(NoTls)?
        };

        log::info!(target: "heatlogd::db", "Database connection established to {}:{}/{}!",
                   params.hostname, params.port, params.database);
        Ok(PostgresStore { client })
    }

    /// Closes the connection, waiting for the server to acknowledge.
    pub fn close(self) -> Result<(), postgres::Error> {
        self.client.close()
    }
}

fn tls_connector(tls_params: &DatabaseTlsParameters) -> Result<MakeTlsConnector, openssl::error::ErrorStack> {
    let mut ssl_connection_builder = SslConnector::builder(SslMethod::tls())?;
    ssl_connection_builder.set_verify(SslVerifyMode::NONE);
    ssl_connection_builder.set_ca_file(&tls_params.server_ca_path)?;
    ssl_connection_builder.set_certificate_file(&tls_params.client_cert_path, SslFiletype::PEM)?;
    ssl_connection_builder.set_private_key_file(&tls_params.client_key_path, SslFiletype::PEM)?;
    Ok(MakeTlsConnector::new(ssl_connection_builder.build()))
}

impl ReadingStore for PostgresStore {
    fn write(&mut self, reading: &SensorReading) -> Result<(), WriteError> {
        let mut transaction = self.client.transaction()
            .map_err(|err| WriteError::new(reading, err))?;

        let metadata = reading.metadata.as_ref().map(Json);
        let inserted = transaction.execute(SQL_INSERT_READING, &[
            &reading.location,
            &reading.temperature,
            &reading.device_id,
            &reading.rssi,
            &reading.battery_level,
            &metadata,
        ]);

        match inserted {
            Ok(_) => transaction.commit().map_err(|err| WriteError::new(reading, err)),
            Err(err) => {
                if let Err(rollback_err) = transaction.rollback() {
                    log::warn!(target: "heatlogd::db", "Could not roll back failed insert: \'{}\'", rollback_err);
                }
                Err(WriteError::new(reading, err))
            }
        }
    }
}
