use anyhow::Result;
use clap::{Parser, Subcommand};
use controller::{format_as_key, resolve_by_key, PersistenceSession};
use shared::{
    domain::{Address, Person, RelationId},
    error::ApiException,
};
use storage::{PersonStore, Storage};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/people.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateRelation {
        name: String,
    },
    CreatePerson {
        firstname: String,
        lastname: String,
        #[arg(long)]
        relation_id: Option<i64>,
        #[arg(long)]
        street: Option<String>,
        #[arg(long, default_value = "")]
        city: String,
        #[arg(long, default_value = "")]
        zip: String,
    },
    List,
    Show {
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateRelation { name } => {
            let relation_id = storage.create_relation(&name).await?;
            println!("created relation_id={relation_id}");
        }
        Command::CreatePerson {
            firstname,
            lastname,
            relation_id,
            street,
            city,
            zip,
        } => {
            let mut person = Person::new(firstname, lastname);
            person.relation = relation_id.map(RelationId);
            person.address = street.map(|street| Address::new(street, city, zip));
            let stored = storage.insert_person(&person).await?;
            println!("created person_id={}", format_as_key(Some(&stored)));
        }
        Command::List => {
            for person in storage.select_all_people().await? {
                println!(
                    "{}\t{}\t{}",
                    format_as_key(Some(&person)),
                    person.firstname,
                    person.lastname
                );
            }
        }
        Command::Show { key } => {
            let mut session = PersistenceSession::open(storage);
            let person = resolve_by_key(&mut session, &key)
                .await
                .map_err(ApiException::from)?;
            match person {
                Some(person) => println!("{person:#?}"),
                None => println!("no person for key '{key}'"),
            }
        }
    }

    Ok(())
}
