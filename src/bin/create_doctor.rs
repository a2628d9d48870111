use std::io::{self, Write};

use bcrypt::{hash, DEFAULT_COST};
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use docplus::error::AppError;
use docplus::models::profile::{AuthState, NewDoctor, NewProfile};
use docplus::store::{Backend, PgBackend};

fn prompt(label: &str) -> io::Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;
    let mut value = String::new();
    io::stdin().read_line(&mut value)?;
    Ok(value.trim().to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("🩺 Doc+ - Create Doctor Account");
    println!("==========================================");

    dotenv().ok();

    let database_url = std::env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set in .env file")?;
    let pool = PgPoolOptions::new().max_connections(2).connect(&database_url).await?;
    let backend = PgBackend::new(pool.clone());
    backend.verify_schema().await?;

    let email = prompt("Email address")?.to_lowercase();
    if email.is_empty() || !email.contains('@') {
        eprintln!("❌ Invalid email address");
        return Ok(());
    }
    if backend.find_identity_by_email(&email).await?.is_some() {
        eprintln!("❌ An account with this email already exists");
        return Ok(());
    }

    let full_name = prompt("Full name")?;
    let registration_number = prompt("Medical registration number")?;
    if full_name.is_empty() || registration_number.is_empty() {
        eprintln!("❌ Full name and registration number are required");
        return Ok(());
    }
    let specialization = Some(prompt("Specialization (optional)")?).filter(|s| !s.is_empty());

    print!("Password: ");
    io::stdout().flush()?;
    let password = rpassword::read_password()?;
    if password.len() < 6 {
        eprintln!("❌ Password must be at least 6 characters long");
        return Ok(());
    }

    print!("Password (again): ");
    io::stdout().flush()?;
    if password != rpassword::read_password()? {
        eprintln!("❌ Passwords don't match");
        return Ok(());
    }

    let password_hash = hash(&password, DEFAULT_COST)?;
    let doctor = NewDoctor {
        user_id: Uuid::nil(),
        full_name,
        email: email.clone(),
        registration_number,
        specialization,
        phone: None,
    };

    match backend.create_account(&email, &password_hash, NewProfile::Doctor(doctor)).await {
        Ok((identity, AuthState::Doctor { profile })) => {
            println!();
            println!("✅ Doctor account created successfully!");
            println!("   User ID: {}", identity.id);
            println!("   Doctor ID: {}", profile.id);
            println!("   Name: {}", profile.full_name);
            println!("   Email: {}", profile.email);
            println!();
            println!("🔐 Sign in with the credentials you just created");
        }
        Ok((identity, _)) => {
            eprintln!("❌ Account {} was created without a doctor profile", identity.id);
        }
        Err(e) if e.is_unique_violation() => {
            eprintln!("❌ That email or registration number is already in use, nothing was created");
        }
        Err(AppError::Backend { code, message }) => {
            eprintln!("❌ Failed to create doctor account ({}): {}", code, message);
        }
        Err(e) => {
            eprintln!("❌ Failed to create doctor account: {}", e);
        }
    }

    pool.close().await;
    Ok(())
}
