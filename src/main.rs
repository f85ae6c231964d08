use std::{
    env, fs,
    fs::OpenOptions,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

mod ledger;
mod receipts;

use ledger::{AccountId, Amount, Bank, BankSnapshot, LedgerEvent, PayoutError, Settlement};
use receipts::{verify_chain, OpKind, ReceiptBody, SignedReceipt};

//==================== Shared structures/helpers ====================//

const STATE_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct BankFile {
    version: u8,
    digest_hex: String, // digest of `snapshot`, checked on every load
    snapshot: BankSnapshot,
}

#[derive(Serialize, Deserialize)]
struct PayoutOrder {
    to: AccountId,
    amount: Amount,
}

/// Payout rail backed by an append-only JSONL file: one order per line,
/// consumed by whatever moves the actual funds downstream.
struct JsonlOutbox {
    path: PathBuf,
}

impl Settlement for JsonlOutbox {
    fn pay_out(&mut self, to: &AccountId, amount: Amount) -> Result<(), PayoutError> {
        let order = PayoutOrder {
            to: to.clone(),
            amount,
        };
        let line = serde_json::to_string(&order).map_err(|err| PayoutError(err.to_string()))?;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| PayoutError(format!("open outbox: {err}")))?;
        writeln!(f, "{line}").map_err(|err| PayoutError(format!("write outbox: {err}")))?;
        Ok(())
    }
}

fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
    let s = s.trim();
    hex::decode(s).map_err(|e| format!("{e}"))
}

fn write_all(p: &Path, bytes: &[u8]) {
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent).ok();
    }
    let mut f = fs::File::create(p).expect("create file");
    f.write_all(bytes).expect("write file");
}

fn usage() -> ! {
    eprintln!(
"Usage:
  bank init     <state_file> --withdraw-limit=<N> --bank-cap=<N>
  bank deposit  <state_file> --account=<ID> --amount=<N> [--sk-hex=<64-hex-secret>] [--receipts=<file>]
  bank withdraw <state_file> --account=<ID> --amount=<N> --outbox=<file> [--sk-hex=<64-hex-secret>] [--receipts=<file>]
  bank receive  <state_file> --account=<ID> --amount=<N>
  bank balance  <state_file> --account=<ID>
  bank status   <state_file>
  bank history  <state_file> [--account=<ID>]

  bank keygen          --out-dir=<dir>
  bank verify-receipts <receipts_file> --pk-hex=<64-hex-public>

Notes:
  - the state file is JSON with an embedded state digest, re-verified on every load
  - receive records an inbound transfer that bypassed deposit; the bank refuses
    such value unconditionally, so the command always fails and changes nothing
  - each successful withdraw appends one payout order to the outbox (JSONL); if the
    outbox cannot be written the withdrawal is rolled back
  - with --sk-hex, deposit/withdraw also append a signed receipt to the receipts
    file (default: <state_file>.receipts.jsonl), digest-chained to the line before
  - sk-hex/pk-hex are raw 32-byte Ed25519 keys in hex (exactly 64 hex chars)"
    );
    std::process::exit(1)
}

fn arg_flag(args: &[String], name: &str) -> Option<String> {
    for a in args {
        if let Some(rest) = a.strip_prefix(&format!("--{}=", name)) {
            return Some(rest.to_string());
        }
    }
    None
}

#[inline]
fn require_flag(args: &[String], name: &str) -> String {
    if let Some(v) = arg_flag(args, name) {
        return v;
    }
    eprintln!("error: missing --{name}\n");
    usage();
}

fn parse_amount(name: &str, value: &str) -> Amount {
    match value.parse() {
        Ok(v) => v,
        Err(err) => {
            eprintln!("error: invalid --{name}: {err}");
            std::process::exit(2);
        }
    }
}

fn parse_sk_hex(sk_hex: &str) -> SigningKey {
    let sk_bytes = match hex_decode(sk_hex) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("error: invalid sk-hex: {err}");
            std::process::exit(2);
        }
    };
    if sk_bytes.len() != 32 {
        eprintln!("error: sk-hex must be 32 bytes (64 hex chars)");
        std::process::exit(2);
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&sk_bytes);
    SigningKey::from_bytes(&arr)
}

fn parse_pk_hex(pk_hex: &str) -> VerifyingKey {
    let pk_bytes = match hex_decode(pk_hex) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("error: invalid pk-hex: {err}");
            std::process::exit(2);
        }
    };
    if pk_bytes.len() != 32 {
        eprintln!("error: pk-hex must be 32 bytes (64 hex chars)");
        std::process::exit(2);
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&pk_bytes);
    match VerifyingKey::from_bytes(&arr) {
        Ok(key) => key,
        Err(err) => {
            eprintln!("error: invalid pk-hex: {err}");
            std::process::exit(2);
        }
    }
}

//==================== State file: load/save ====================//

fn load_bank(path: &Path) -> Bank {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("error: read {}: {err}", path.display());
            std::process::exit(2);
        }
    };
    let file: BankFile = match serde_json::from_slice(&bytes) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("error: parse {}: {err}", path.display());
            std::process::exit(2);
        }
    };
    if file.version != STATE_VERSION {
        eprintln!(
            "error: {}: unsupported state version {}",
            path.display(),
            file.version
        );
        std::process::exit(2);
    }
    if hex::encode(file.snapshot.digest()) != file.digest_hex {
        eprintln!("error: {}: state digest mismatch", path.display());
        std::process::exit(2);
    }
    match Bank::restore(file.snapshot) {
        Ok(bank) => bank,
        Err(err) => {
            eprintln!("error: {}: {err}", path.display());
            std::process::exit(2);
        }
    }
}

fn save_bank(path: &Path, bank: &Bank) {
    let snapshot = bank.snapshot();
    let file = BankFile {
        version: STATE_VERSION,
        digest_hex: hex::encode(snapshot.digest()),
        snapshot,
    };
    let json = serde_json::to_vec_pretty(&file).expect("state encode");
    write_all(path, &json);
}

//==================== Receipts: chained append ====================//

fn read_receipts(path: &Path) -> Vec<SignedReceipt> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("error: open {}: {err}", path.display());
            std::process::exit(2);
        }
    };
    let reader = BufReader::new(file);
    let mut receipts = Vec::new();
    for line in reader.lines() {
        let l = match line {
            Ok(l) => l,
            Err(err) => {
                eprintln!("error: read {}: {err}", path.display());
                std::process::exit(2);
            }
        };
        if l.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&l) {
            Ok(receipt) => receipts.push(receipt),
            Err(err) => {
                eprintln!("error: parse receipt in {}: {err}", path.display());
                std::process::exit(2);
            }
        }
    }
    receipts
}

fn append_receipt(
    path: &Path,
    key: &SigningKey,
    op: OpKind,
    account: &AccountId,
    amount: Amount,
    new_balance: Amount,
    bank: &Bank,
) {
    let (seq, prev) = if path.exists() {
        match read_receipts(path).last() {
            Some(last) => (last.body.seq + 1, Some(last.body.digest())),
            None => (0, None),
        }
    } else {
        (0, None)
    };
    let body = ReceiptBody {
        seq,
        op,
        account: account.clone(),
        amount,
        new_balance,
        total_balance: bank.total_balance(),
        state_digest: bank.snapshot().digest(),
        prev,
    };
    let receipt = SignedReceipt::sign(key, body);
    let line = serde_json::to_string(&receipt).expect("receipt encode");
    let mut f = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(f) => f,
        Err(err) => {
            eprintln!("error: open {}: {err}", path.display());
            std::process::exit(2);
        }
    };
    if let Err(err) = writeln!(f, "{line}") {
        eprintln!("error: write {}: {err}", path.display());
        std::process::exit(2);
    }
}

fn receipts_path(args: &[String], state_path: &Path) -> PathBuf {
    arg_flag(args, "receipts")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("{}.receipts.jsonl", state_path.display())))
}

//==================== Commands ====================//

fn init_cmd(args: &[String]) {
    if args.is_empty() {
        usage();
    }
    let state_path = PathBuf::from(&args[0]);
    let withdraw_limit = parse_amount("withdraw-limit", &require_flag(args, "withdraw-limit"));
    let bank_cap = parse_amount("bank-cap", &require_flag(args, "bank-cap"));

    if state_path.exists() {
        eprintln!("error: {} already exists", state_path.display());
        std::process::exit(2);
    }
    let bank = match Bank::new(withdraw_limit, bank_cap) {
        Ok(bank) => bank,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    save_bank(&state_path, &bank);
    println!(
        "bank initialized → {} (withdraw limit {}, cap {})",
        state_path.display(),
        withdraw_limit,
        bank_cap
    );
}

fn deposit_cmd(args: &[String]) {
    if args.is_empty() {
        usage();
    }
    let state_path = PathBuf::from(&args[0]);
    let account: AccountId = require_flag(args, "account");
    let amount = parse_amount("amount", &require_flag(args, "amount"));

    let mut bank = load_bank(&state_path);
    let new_balance = match bank.deposit(&account, amount) {
        Ok(balance) => balance,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    save_bank(&state_path, &bank);
    if let Some(sk_hex) = arg_flag(args, "sk-hex") {
        let key = parse_sk_hex(&sk_hex);
        let path = receipts_path(args, &state_path);
        append_receipt(
            &path,
            &key,
            OpKind::Deposit,
            &account,
            amount,
            new_balance,
            &bank,
        );
    }
    println!(
        "deposited {amount} → {account} balance {new_balance} (total {})",
        bank.total_balance()
    );
}

fn withdraw_cmd(args: &[String]) {
    if args.is_empty() {
        usage();
    }
    let state_path = PathBuf::from(&args[0]);
    let account: AccountId = require_flag(args, "account");
    let amount = parse_amount("amount", &require_flag(args, "amount"));
    let mut outbox = JsonlOutbox {
        path: PathBuf::from(require_flag(args, "outbox")),
    };

    let mut bank = load_bank(&state_path);
    let new_balance = match bank.withdraw(&account, amount, &mut outbox) {
        Ok(balance) => balance,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    save_bank(&state_path, &bank);
    if let Some(sk_hex) = arg_flag(args, "sk-hex") {
        let key = parse_sk_hex(&sk_hex);
        let path = receipts_path(args, &state_path);
        append_receipt(
            &path,
            &key,
            OpKind::Withdraw,
            &account,
            amount,
            new_balance,
            &bank,
        );
    }
    println!(
        "withdrew {amount} → {account} balance {new_balance} (total {}), payout queued in {}",
        bank.total_balance(),
        outbox.path.display()
    );
}

fn receive_cmd(args: &[String]) {
    if args.is_empty() {
        usage();
    }
    let state_path = PathBuf::from(&args[0]);
    let account: AccountId = require_flag(args, "account");
    let amount = parse_amount("amount", &require_flag(args, "amount"));
    let mut bank = load_bank(&state_path);
    if let Err(err) = bank.receive_transfer(&account, amount) {
        eprintln!("error: {err}");
        std::process::exit(2);
    }
}

fn balance_cmd(args: &[String]) {
    if args.is_empty() {
        usage();
    }
    let state_path = PathBuf::from(&args[0]);
    let account: AccountId = require_flag(args, "account");
    let bank = load_bank(&state_path);
    println!("{}", bank.balance_of(&account));
}

fn status_cmd(args: &[String]) {
    if args.is_empty() {
        usage();
    }
    let state_path = PathBuf::from(&args[0]);
    let bank = load_bank(&state_path);
    println!("withdraw limit : {}", bank.withdraw_limit());
    println!("bank cap       : {}", bank.bank_cap());
    println!("total balance  : {}", bank.total_balance());
    println!("deposits       : {}", bank.deposit_count());
    println!("withdrawals    : {}", bank.withdraw_count());
    println!("state digest   : {}", hex::encode(bank.snapshot().digest()));
}

fn history_cmd(args: &[String]) {
    if args.is_empty() {
        usage();
    }
    let state_path = PathBuf::from(&args[0]);
    let filter = arg_flag(args, "account");
    let bank = load_bank(&state_path);
    for event in bank.events() {
        if let Some(wanted) = &filter {
            let account = match event {
                LedgerEvent::Deposited { account, .. } => account,
                LedgerEvent::Withdrawn { account, .. } => account,
            };
            if account != wanted {
                continue;
            }
        }
        println!("{}", serde_json::to_string(event).expect("event encode"));
    }
}

fn keygen_cmd(args: &[String]) {
    let out_dir = PathBuf::from(require_flag(args, "out-dir"));
    fs::create_dir_all(&out_dir).expect("mkdir out-dir");

    let mut sk_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut sk_bytes);
    let sk = SigningKey::from_bytes(&sk_bytes);
    let pk = sk.verifying_key();

    write_all(&out_dir.join("sk.hex"), hex::encode(sk_bytes).as_bytes());
    write_all(&out_dir.join("pk.hex"), hex::encode(pk.as_bytes()).as_bytes());
    println!("keypair written → {}", out_dir.display());
}

fn verify_receipts_cmd(args: &[String]) {
    if args.is_empty() {
        usage();
    }
    let receipts_file = PathBuf::from(&args[0]);
    let key = parse_pk_hex(&require_flag(args, "pk-hex"));
    let receipts = read_receipts(&receipts_file);
    match verify_chain(&receipts, &key) {
        Ok(()) => println!("verify-receipts: OK ({} receipts)", receipts.len()),
        Err(err) => {
            eprintln!("verify-receipts: FAILED: {err}");
            std::process::exit(2);
        }
    }
}

//==================== main ====================//

fn main() {
    let mut args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        usage();
    }
    if args.len() == 1 && (args[0] == "help" || args[0] == "--help" || args[0] == "-h") {
        usage();
    }
    let cmd = args.remove(0);
    match cmd.as_str() {
        "init" => init_cmd(&args),
        "deposit" => deposit_cmd(&args),
        "withdraw" => withdraw_cmd(&args),
        "receive" => receive_cmd(&args),
        "balance" => balance_cmd(&args),
        "status" => status_cmd(&args),
        "history" => history_cmd(&args),
        "keygen" => keygen_cmd(&args),
        "verify-receipts" => verify_receipts_cmd(&args),
        _ => usage(),
    }
}
