use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::Points;
use crate::model::{Account, AccountId, Command, TransferRequest};

/// Errors that can occur when reading command rows
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized command type '{cmd_type}'")]
    UnrecognizedType { line: usize, cmd_type: String },

    #[error("line {line}: {cmd_type} missing {field}")]
    MissingField {
        line: usize,
        cmd_type: &'static str,
        field: &'static str,
    },
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    account: Option<AccountId>,
    counterparty: Option<AccountId>,
    amount: Option<i64>,
    key: Option<String>,
    note: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    account: AccountId,
    name: &'a str,
    balance: i64,
}

fn required<T>(
    value: Option<T>,
    line: usize,
    cmd_type: &'static str,
    field: &'static str,
) -> Result<T, CsvError> {
    value.ok_or(CsvError::MissingField {
        line,
        cmd_type,
        field,
    })
}

impl InputRow {
    fn into_command(self, line: usize) -> Result<Command, CsvError> {
        match self.r#type.as_str() {
            "open" => Ok(Command::Open {
                account: required(self.account, line, "open", "account")?,
                name: required(self.note, line, "open", "note")?,
                balance: Points::new(self.amount.unwrap_or_default()),
            }),
            "transfer" => {
                let request = TransferRequest {
                    from: required(self.account, line, "transfer", "account")?,
                    to: required(self.counterparty, line, "transfer", "counterparty")?,
                    amount: Points::new(required(self.amount, line, "transfer", "amount")?),
                    note: self.note,
                    idempotency_key: required(self.key, line, "transfer", "key")?,
                };
                Ok(Command::Transfer(request))
            }
            "cancel" => Ok(Command::Cancel {
                key: required(self.key, line, "cancel", "key")?,
            }),
            other => Err(CsvError::UnrecognizedType {
                line,
                cmd_type: other.to_string(),
            }),
        }
    }
}

/// Read commands from a csv file
pub fn read_commands(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Command, CsvError>>, CsvError> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            row.into_command(line)
        }))
}

/// Write account balances in csv format
pub fn write_accounts<'a, W: io::Write>(
    writer: W,
    accounts: impl IntoIterator<Item = &'a Account>,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);

    for account in accounts {
        writer.serialize(OutputRow {
            account: account.id,
            name: &account.name,
            balance: account.balance.value(),
        })?;
    }

    writer.flush()?;
    Ok(())
}
